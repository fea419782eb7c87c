use live_core::model::SessionStatus;
use sqlx::Row;

use super::SqliteRepository;
use super::mapping::{conn, parse_status, ser, u32_from_i64, usize_from_i64, usize_to_i64};
use crate::repository::{AnswerRepository, AnswerSubmission, AnswerWrite, StorageError};

#[async_trait::async_trait]
impl AnswerRepository for SqliteRepository {
    async fn record_answer(&self, submission: &AnswerSubmission) -> Result<AnswerWrite, StorageError> {
        let session_id = submission.session_id.to_string();
        let user_id = submission.user_id.as_str();
        let question_index = usize_to_i64("question_index", submission.question_index)?;
        let points = i64::from(submission.points);

        let mut tx = self.pool.begin().await.map_err(conn)?;

        // The slot's primary key makes this insert the first-write-wins
        // decision; the score bump only happens when the insert landed. The
        // join on the session refuses slots once it is no longer active.
        let inserted = sqlx::query(
            r"
                INSERT INTO participant_answers (
                    session_id, user_id, question_index, answer_index, points, answered_at
                )
                SELECT ?1, ?2, ?3, ?4, ?5, ?6
                FROM session_participants p
                JOIN live_sessions s ON s.id = p.session_id
                WHERE p.session_id = ?1 AND p.user_id = ?2 AND ?3 < p.answer_slots
                  AND s.status = ?7
                ON CONFLICT(session_id, user_id, question_index) DO NOTHING
            ",
        )
        .bind(&session_id)
        .bind(user_id)
        .bind(question_index)
        .bind(i64::from(submission.answer_index))
        .bind(points)
        .bind(submission.answered_at)
        .bind(SessionStatus::Active.as_str())
        .execute(&mut *tx)
        .await
        .map_err(conn)?
        .rows_affected()
            == 1;

        if inserted {
            sqlx::query(
                r"
                    UPDATE session_participants
                    SET score = score + ?1
                    WHERE session_id = ?2 AND user_id = ?3
                ",
            )
            .bind(points)
            .bind(&session_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(conn)?;
        }

        let status = if inserted {
            SessionStatus::Active
        } else {
            let row = sqlx::query("SELECT status FROM live_sessions WHERE id = ?1")
                .bind(&session_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(conn)?
                .ok_or(StorageError::NotFound)?;
            parse_status(&row.try_get::<String, _>("status").map_err(ser)?)?
        };

        let row = sqlx::query(
            r"
                SELECT score, answer_slots
                FROM session_participants
                WHERE session_id = ?1 AND user_id = ?2
            ",
        )
        .bind(&session_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(conn)?;

        tx.commit().await.map_err(conn)?;

        if status != SessionStatus::Active {
            return Ok(AnswerWrite::Closed { status });
        }
        let Some(row) = row else {
            return Ok(AnswerWrite::NotJoined);
        };
        let score = u32_from_i64("score", row.try_get::<i64, _>("score").map_err(ser)?)?;
        if inserted {
            return Ok(AnswerWrite::Recorded { score });
        }
        let slots = usize_from_i64(
            "answer_slots",
            row.try_get::<i64, _>("answer_slots").map_err(ser)?,
        )?;
        if submission.question_index >= slots {
            return Ok(AnswerWrite::OutOfRange { slots });
        }
        Ok(AnswerWrite::AlreadyAnswered { score })
    }
}
