use std::collections::HashMap;

use live_core::model::{
    LiveSession, Participant, PersistedSession, Question, Registration, SessionId, SessionStatus,
    UserId,
};
use sqlx::Row;

use crate::repository::StorageError;

pub(crate) fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

pub(crate) fn conn(e: sqlx::Error) -> StorageError {
    StorageError::Connection(e.to_string())
}

pub(crate) fn session_id_from_text(v: &str) -> Result<SessionId, StorageError> {
    v.parse().map_err(ser)
}

pub(crate) fn user_id_from_text(v: String) -> Result<UserId, StorageError> {
    UserId::new(v).map_err(ser)
}

pub(crate) fn u32_from_i64(field: &'static str, v: i64) -> Result<u32, StorageError> {
    u32::try_from(v).map_err(|_| StorageError::Serialization(format!("invalid {field}: {v}")))
}

pub(crate) fn usize_from_i64(field: &'static str, v: i64) -> Result<usize, StorageError> {
    usize::try_from(v).map_err(|_| StorageError::Serialization(format!("invalid {field}: {v}")))
}

pub(crate) fn usize_to_i64(field: &'static str, v: usize) -> Result<i64, StorageError> {
    i64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} overflow")))
}

pub(crate) fn i64_to_u64(field: &'static str, v: i64) -> Result<u64, StorageError> {
    u64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} sign overflow")))
}

pub(crate) fn u64_to_i64(field: &'static str, v: u64) -> Result<i64, StorageError> {
    i64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} overflow")))
}

pub(crate) fn parse_status(s: &str) -> Result<SessionStatus, StorageError> {
    s.parse().map_err(ser)
}

pub(crate) fn questions_to_json(questions: &[Question]) -> Result<String, StorageError> {
    serde_json::to_string(questions).map_err(ser)
}

fn questions_from_json(raw: &str) -> Result<Vec<Question>, StorageError> {
    serde_json::from_str(raw).map_err(ser)
}

pub(crate) fn map_registration_row(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<Registration, StorageError> {
    Ok(Registration {
        user_id: user_id_from_text(row.try_get("user_id").map_err(ser)?)?,
        username: row.try_get("username").map_err(ser)?,
        display_name: row.try_get("display_name").map_err(ser)?,
        registered_at: row.try_get("registered_at").map_err(ser)?,
    })
}

/// Answer rows grouped by user: `(question_index, answer_index)` pairs.
pub(crate) type AnswerIndex = HashMap<String, Vec<(usize, u32)>>;

pub(crate) fn index_answer_rows(
    rows: &[sqlx::sqlite::SqliteRow],
) -> Result<AnswerIndex, StorageError> {
    let mut index: AnswerIndex = HashMap::new();
    for row in rows {
        let user_id: String = row.try_get("user_id").map_err(ser)?;
        let question_index = usize_from_i64(
            "question_index",
            row.try_get::<i64, _>("question_index").map_err(ser)?,
        )?;
        let answer_index = u32_from_i64(
            "answer_index",
            row.try_get::<i64, _>("answer_index").map_err(ser)?,
        )?;
        index
            .entry(user_id)
            .or_default()
            .push((question_index, answer_index));
    }
    Ok(index)
}

pub(crate) fn map_participant_row(
    row: &sqlx::sqlite::SqliteRow,
    answers: &AnswerIndex,
) -> Result<Participant, StorageError> {
    let raw_user_id: String = row.try_get("user_id").map_err(ser)?;
    let slots = usize_from_i64(
        "answer_slots",
        row.try_get::<i64, _>("answer_slots").map_err(ser)?,
    )?;
    let mut filled = vec![None; slots];
    for &(question_index, answer_index) in answers.get(&raw_user_id).into_iter().flatten() {
        let slot = filled.get_mut(question_index).ok_or_else(|| {
            StorageError::Serialization(format!(
                "answer for question {question_index} exceeds {slots} slots"
            ))
        })?;
        *slot = Some(answer_index);
    }

    Ok(Participant::from_persisted(
        user_id_from_text(raw_user_id)?,
        row.try_get("username").map_err(ser)?,
        row.try_get("display_name").map_err(ser)?,
        filled,
        u32_from_i64("score", row.try_get::<i64, _>("score").map_err(ser)?)?,
        row.try_get("joined_at").map_err(ser)?,
    ))
}

pub(crate) fn map_session_row(
    row: &sqlx::sqlite::SqliteRow,
    registrations: Vec<Registration>,
    participants: Vec<Participant>,
) -> Result<LiveSession, StorageError> {
    let id: String = row.try_get("id").map_err(ser)?;
    let status: String = row.try_get("status").map_err(ser)?;
    let questions: String = row.try_get("questions").map_err(ser)?;
    let max_participants = row
        .try_get::<Option<i64>, _>("max_participants")
        .map_err(ser)?
        .map(|v| u32_from_i64("max_participants", v))
        .transpose()?;

    LiveSession::from_persisted(PersistedSession {
        id: session_id_from_text(&id)?,
        name: row.try_get("name").map_err(ser)?,
        description: row.try_get("description").map_err(ser)?,
        level: row.try_get("level").map_err(ser)?,
        scheduled_start: row.try_get("scheduled_start").map_err(ser)?,
        duration_minutes: u32_from_i64(
            "duration_minutes",
            row.try_get::<i64, _>("duration_minutes").map_err(ser)?,
        )?,
        questions: questions_from_json(&questions)?,
        max_participants,
        open_enrollment: row.try_get("open_enrollment").map_err(ser)?,
        cancelled: row.try_get("cancelled").map_err(ser)?,
        status: parse_status(&status)?,
        created_at: row.try_get("created_at").map_err(ser)?,
        revision: i64_to_u64("revision", row.try_get::<i64, _>("revision").map_err(ser)?)?,
        registrations,
        participants,
    })
    .map_err(ser)
}
