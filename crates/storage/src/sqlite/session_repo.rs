use std::collections::HashMap;

use live_core::model::{LiveSession, SessionId, SessionStatus};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::SqliteRepository;
use super::mapping::{
    conn, index_answer_rows, map_participant_row, map_registration_row, map_session_row,
    questions_to_json, ser, u64_to_i64, usize_to_i64,
};
use crate::repository::{
    SessionFilter, SessionListing, SessionRepository, StorageError, UnreadableSession,
};

const SESSION_COLUMNS: &str = r"
    id, name, description, level, scheduled_start, duration_minutes,
    questions, max_participants, open_enrollment, cancelled, status,
    created_at, revision
";

impl SqliteRepository {
    async fn session_exists(&self, id: &str) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM live_sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?;
        Ok(row.is_some())
    }

    /// Fetches rows of a child table for every id in one query, grouped by
    /// `session_id`.
    async fn child_rows(
        &self,
        select: &str,
        order_by: &str,
        ids: &[String],
    ) -> Result<RowsBySession, StorageError> {
        let placeholders = (1..=ids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("{select} WHERE session_id IN ({placeholders}) {order_by}");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.as_str());
        }
        let rows = query.fetch_all(&self.pool).await.map_err(conn)?;

        let mut grouped = RowsBySession::new();
        for row in rows {
            let session_id: String = row.try_get("session_id").map_err(ser)?;
            grouped.entry(session_id).or_default().push(row);
        }
        Ok(grouped)
    }

    /// Rebuilds sessions with their memberships using three batched queries.
    /// Rows that fail to map are reported instead of failing the batch.
    async fn hydrate_all(&self, rows: &[SqliteRow]) -> Result<SessionListing, StorageError> {
        if rows.is_empty() {
            return Ok(SessionListing::default());
        }
        let ids: Vec<String> = rows
            .iter()
            .map(|row| row.try_get::<String, _>("id").unwrap_or_default())
            .collect();

        let registrations = self
            .child_rows(
                "SELECT session_id, user_id, username, display_name, registered_at \
                 FROM session_registrations",
                "ORDER BY registered_at ASC, user_id ASC",
                &ids,
            )
            .await?;
        let participants = self
            .child_rows(
                "SELECT session_id, user_id, username, display_name, joined_at, answer_slots, score \
                 FROM session_participants",
                "ORDER BY joined_at ASC, user_id ASC",
                &ids,
            )
            .await?;
        let answers = self
            .child_rows(
                "SELECT session_id, user_id, question_index, answer_index FROM participant_answers",
                "",
                &ids,
            )
            .await?;

        let mut listing = SessionListing::default();
        for (row, id) in rows.iter().zip(ids) {
            match assemble(
                row,
                rows_for(&registrations, &id),
                rows_for(&participants, &id),
                rows_for(&answers, &id),
            ) {
                Ok(session) => listing.sessions.push(session),
                Err(error) => listing.unreadable.push(UnreadableSession { id, error }),
            }
        }
        Ok(listing)
    }
}

type RowsBySession = HashMap<String, Vec<SqliteRow>>;

fn rows_for<'a>(grouped: &'a RowsBySession, session_id: &str) -> &'a [SqliteRow] {
    grouped.get(session_id).map_or(&[][..], Vec::as_slice)
}

fn assemble(
    row: &SqliteRow,
    registration_rows: &[SqliteRow],
    participant_rows: &[SqliteRow],
    answer_rows: &[SqliteRow],
) -> Result<LiveSession, StorageError> {
    let registrations = registration_rows
        .iter()
        .map(map_registration_row)
        .collect::<Result<Vec<_>, _>>()?;
    let answers = index_answer_rows(answer_rows)?;
    let participants = participant_rows
        .iter()
        .map(|r| map_participant_row(r, &answers))
        .collect::<Result<Vec<_>, _>>()?;
    map_session_row(row, registrations, participants)
}

#[async_trait::async_trait]
impl SessionRepository for SqliteRepository {
    async fn insert_session(&self, session: &LiveSession) -> Result<(), StorageError> {
        let res = sqlx::query(
            r"
                INSERT INTO live_sessions (
                    id, name, description, level, scheduled_start, duration_minutes,
                    questions, question_count, max_participants, open_enrollment,
                    cancelled, status, created_at, revision
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                ON CONFLICT(id) DO NOTHING
            ",
        )
        .bind(session.id().to_string())
        .bind(session.name())
        .bind(session.description())
        .bind(session.level())
        .bind(session.scheduled_start())
        .bind(i64::from(session.duration_minutes()))
        .bind(questions_to_json(session.questions())?)
        .bind(usize_to_i64("question_count", session.questions().len())?)
        .bind(session.max_participants().map(i64::from))
        .bind(session.open_enrollment())
        .bind(session.is_cancelled())
        .bind(session.cached_status().as_str())
        .bind(session.created_at())
        .bind(u64_to_i64("revision", session.revision())?)
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        if res.rows_affected() == 0 {
            return Err(StorageError::Conflict);
        }
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<LiveSession>, StorageError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM live_sessions WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut listing = self.hydrate_all(std::slice::from_ref(&row)).await?;
        if let Some(unreadable) = listing.unreadable.pop() {
            return Err(unreadable.error);
        }
        Ok(listing.sessions.pop())
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> Result<SessionListing, StorageError> {
        let mut sql = format!("SELECT {SESSION_COLUMNS} FROM live_sessions WHERE 1 = 1");
        let mut bind_index = 1;
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
            sql.push_str(&bind_index.to_string());
            bind_index += 1;
        }
        if filter.level.is_some() {
            sql.push_str(" AND level = ?");
            sql.push_str(&bind_index.to_string());
        }
        sql.push_str(" ORDER BY scheduled_start ASC, id ASC");

        let mut query = sqlx::query(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(level) = &filter.level {
            query = query.bind(level.as_str());
        }

        let rows = query.fetch_all(&self.pool).await.map_err(conn)?;
        self.hydrate_all(&rows).await
    }

    async fn update_session(&self, session: &LiveSession) -> Result<u64, StorageError> {
        let id = session.id().to_string();
        let expected = u64_to_i64("revision", session.revision())?;
        let res = sqlx::query(
            r"
                UPDATE live_sessions
                SET name = ?1,
                    description = ?2,
                    level = ?3,
                    scheduled_start = ?4,
                    duration_minutes = ?5,
                    questions = ?6,
                    question_count = ?7,
                    max_participants = ?8,
                    open_enrollment = ?9,
                    revision = revision + 1
                WHERE id = ?10 AND revision = ?11
                  AND (
                    questions = ?6
                    OR (
                      status = ?12
                      AND NOT EXISTS (
                        SELECT 1 FROM session_participants p WHERE p.session_id = ?10
                      )
                    )
                  )
                  AND (
                    ?8 IS NULL
                    OR (SELECT COUNT(*) FROM session_registrations r WHERE r.session_id = ?10) <= ?8
                  )
            ",
        )
        .bind(session.name())
        .bind(session.description())
        .bind(session.level())
        .bind(session.scheduled_start())
        .bind(i64::from(session.duration_minutes()))
        .bind(questions_to_json(session.questions())?)
        .bind(usize_to_i64("question_count", session.questions().len())?)
        .bind(session.max_participants().map(i64::from))
        .bind(session.open_enrollment())
        .bind(&id)
        .bind(expected)
        .bind(SessionStatus::Scheduled.as_str())
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        if res.rows_affected() == 0 {
            return if self.session_exists(&id).await? {
                Err(StorageError::Conflict)
            } else {
                Err(StorageError::NotFound)
            };
        }
        Ok(session.revision() + 1)
    }

    async fn write_back_status(
        &self,
        id: SessionId,
        expected: SessionStatus,
        computed: SessionStatus,
    ) -> Result<bool, StorageError> {
        let res = sqlx::query(
            r"
                UPDATE live_sessions
                SET status = ?1
                WHERE id = ?2 AND status = ?3
            ",
        )
        .bind(computed.as_str())
        .bind(id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(conn)?;
        Ok(res.rows_affected() == 1)
    }

    async fn cancel_session(&self, id: SessionId) -> Result<bool, StorageError> {
        let id = id.to_string();
        let res = sqlx::query(
            r"
                UPDATE live_sessions
                SET cancelled = 1,
                    status = ?1,
                    revision = revision + 1
                WHERE id = ?2 AND cancelled = 0
            ",
        )
        .bind(SessionStatus::Cancelled.as_str())
        .bind(&id)
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        if res.rows_affected() == 1 {
            return Ok(true);
        }
        if self.session_exists(&id).await? {
            Ok(false)
        } else {
            Err(StorageError::NotFound)
        }
    }

    async fn delete_session(&self, id: SessionId) -> Result<(), StorageError> {
        let res = sqlx::query("DELETE FROM live_sessions WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(conn)?;
        if res.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }
}
