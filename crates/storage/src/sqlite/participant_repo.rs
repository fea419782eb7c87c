use chrono::{DateTime, Utc};
use live_core::model::{
    Participant, Registration, RegistrationWrite, SessionId, SessionStatus, UserId, UserProfile,
};
use sqlx::Row;

use super::SqliteRepository;
use super::mapping::{
    conn, index_answer_rows, map_participant_row, map_registration_row, parse_status, ser,
    u32_from_i64,
};
use crate::repository::{JoinWrite, ParticipantRepository, StorageError};

impl SqliteRepository {
    async fn load_registrations(
        &self,
        session_id: &str,
    ) -> Result<Vec<Registration>, StorageError> {
        let rows = sqlx::query(
            r"
                SELECT user_id, username, display_name, registered_at
                FROM session_registrations
                WHERE session_id = ?1
                ORDER BY registered_at ASC, user_id ASC
            ",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;

        rows.iter().map(map_registration_row).collect()
    }

    async fn load_participants(
        &self,
        session_id: &str,
    ) -> Result<Vec<Participant>, StorageError> {
        self.fetch_participants(session_id, None).await
    }

    async fn fetch_participants(
        &self,
        session_id: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<Participant>, StorageError> {
        let user_clause = if user_id.is_some() { " AND user_id = ?2" } else { "" };

        let participant_sql = format!(
            r"
                SELECT user_id, username, display_name, joined_at, answer_slots, score
                FROM session_participants
                WHERE session_id = ?1{user_clause}
                ORDER BY joined_at ASC, user_id ASC
            "
        );
        let answer_sql = format!(
            r"
                SELECT user_id, question_index, answer_index
                FROM participant_answers
                WHERE session_id = ?1{user_clause}
            "
        );

        let mut participant_query = sqlx::query(&participant_sql).bind(session_id);
        let mut answer_query = sqlx::query(&answer_sql).bind(session_id);
        if let Some(user_id) = user_id {
            participant_query = participant_query.bind(user_id);
            answer_query = answer_query.bind(user_id);
        }

        let participant_rows = participant_query.fetch_all(&self.pool).await.map_err(conn)?;
        if participant_rows.is_empty() {
            return Ok(Vec::new());
        }
        let answer_rows = answer_query.fetch_all(&self.pool).await.map_err(conn)?;
        let answers = index_answer_rows(&answer_rows)?;

        participant_rows
            .iter()
            .map(|row| map_participant_row(row, &answers))
            .collect()
    }

    /// Stored status and cap, read after a guarded insert was refused.
    async fn admission_state(
        &self,
        session_id: &str,
    ) -> Result<(SessionStatus, Option<u32>), StorageError> {
        let row = sqlx::query("SELECT status, max_participants FROM live_sessions WHERE id = ?1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?
            .ok_or(StorageError::NotFound)?;
        let status = parse_status(&row.try_get::<String, _>("status").map_err(ser)?)?;
        let max = row
            .try_get::<Option<i64>, _>("max_participants")
            .map_err(ser)?
            .map(|v| u32_from_i64("max_participants", v))
            .transpose()?;
        Ok((status, max))
    }
}

#[async_trait::async_trait]
impl ParticipantRepository for SqliteRepository {
    async fn register(
        &self,
        id: SessionId,
        user: &UserProfile,
        at: DateTime<Utc>,
    ) -> Result<RegistrationWrite, StorageError> {
        let session_id = id.to_string();

        // Status check, cap check and insert run as one statement, so a cancel
        // or concurrent registrations cannot slip past them.
        let res = sqlx::query(
            r"
                INSERT INTO session_registrations (
                    session_id, user_id, username, display_name, registered_at
                )
                SELECT ?1, ?2, ?3, ?4, ?5
                FROM live_sessions s
                WHERE s.id = ?1
                  AND s.cancelled = 0
                  AND s.status NOT IN (?6, ?7)
                  AND (
                    s.max_participants IS NULL
                    OR (SELECT COUNT(*) FROM session_registrations r WHERE r.session_id = ?1)
                        < s.max_participants
                  )
                ON CONFLICT(session_id, user_id) DO NOTHING
            ",
        )
        .bind(&session_id)
        .bind(user.user_id.as_str())
        .bind(&user.username)
        .bind(&user.display_name)
        .bind(at)
        .bind(SessionStatus::Completed.as_str())
        .bind(SessionStatus::Cancelled.as_str())
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        if res.rows_affected() == 1 {
            return Ok(RegistrationWrite::Registered);
        }

        let (status, max) = self.admission_state(&session_id).await?;
        if status.is_terminal() {
            return Ok(RegistrationWrite::Closed { status });
        }

        let existing = sqlx::query(
            "SELECT 1 FROM session_registrations WHERE session_id = ?1 AND user_id = ?2",
        )
        .bind(&session_id)
        .bind(user.user_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?;
        if existing.is_some() {
            return Ok(RegistrationWrite::AlreadyRegistered);
        }

        match max {
            Some(max) => Ok(RegistrationWrite::CapacityExceeded { max }),
            None => Err(StorageError::Conflict),
        }
    }

    async fn unregister(&self, id: SessionId, user_id: &UserId) -> Result<bool, StorageError> {
        let res = sqlx::query(
            "DELETE FROM session_registrations WHERE session_id = ?1 AND user_id = ?2",
        )
        .bind(id.to_string())
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(conn)?;
        Ok(res.rows_affected() == 1)
    }

    async fn list_registrations(&self, id: SessionId) -> Result<Vec<Registration>, StorageError> {
        self.load_registrations(&id.to_string()).await
    }

    async fn join(
        &self,
        id: SessionId,
        user: &UserProfile,
        at: DateTime<Utc>,
    ) -> Result<JoinWrite, StorageError> {
        let session_id = id.to_string();
        let res = sqlx::query(
            r"
                INSERT INTO session_participants (
                    session_id, user_id, username, display_name, joined_at,
                    answer_slots, score
                )
                SELECT ?1, ?2, ?3, ?4, ?5, s.question_count, 0
                FROM live_sessions s
                WHERE s.id = ?1
                  AND s.cancelled = 0
                  AND s.status IN (?6, ?7)
                ON CONFLICT(session_id, user_id) DO NOTHING
            ",
        )
        .bind(&session_id)
        .bind(user.user_id.as_str())
        .bind(&user.username)
        .bind(&user.display_name)
        .bind(at)
        .bind(SessionStatus::Lobby.as_str())
        .bind(SessionStatus::Active.as_str())
        .execute(&self.pool)
        .await
        .map_err(conn)?;
        let joined = res.rows_affected() == 1;

        if !joined {
            let (status, _) = self.admission_state(&session_id).await?;
            if !status.accepts_join() {
                return Ok(JoinWrite::Closed { status });
            }
        }

        let participant = self
            .fetch_participants(&session_id, Some(user.user_id.as_str()))
            .await?
            .into_iter()
            .next()
            .ok_or(StorageError::NotFound)?;

        Ok(if joined {
            JoinWrite::Joined(participant)
        } else {
            JoinWrite::AlreadyJoined(participant)
        })
    }

    async fn get_participant(
        &self,
        id: SessionId,
        user_id: &UserId,
    ) -> Result<Option<Participant>, StorageError> {
        Ok(self
            .fetch_participants(&id.to_string(), Some(user_id.as_str()))
            .await?
            .into_iter()
            .next())
    }

    async fn list_participants(&self, id: SessionId) -> Result<Vec<Participant>, StorageError> {
        self.load_participants(&id.to_string()).await
    }
}
