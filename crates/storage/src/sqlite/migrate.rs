use chrono::Utc;
use sqlx::SqlitePool;

use super::SqliteInitError;

/// Runs versioned migrations for the live-session schema.
///
/// Participants and answers live in child tables so that the answer slot
/// primary key can enforce first-write-wins inside the database.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), SqliteInitError> {
    async fn is_applied(pool: &SqlitePool, version: i64) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM schema_migrations WHERE version = ?1")
            .bind(version)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }

    sqlx::query(
        r"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            ",
    )
    .execute(pool)
    .await?;

    // Version 1: sessions, interest lists, participants, answers.
    if !is_applied(pool, 1).await? {
        let mut tx = pool.begin().await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS live_sessions (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT,
                    level TEXT NOT NULL,
                    scheduled_start TEXT NOT NULL,
                    duration_minutes INTEGER NOT NULL CHECK (duration_minutes > 0),
                    questions TEXT NOT NULL,
                    question_count INTEGER NOT NULL CHECK (question_count > 0),
                    max_participants INTEGER CHECK (max_participants IS NULL OR max_participants > 0),
                    open_enrollment INTEGER NOT NULL DEFAULT 0,
                    cancelled INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    revision INTEGER NOT NULL DEFAULT 0 CHECK (revision >= 0)
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS session_registrations (
                    session_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    username TEXT NOT NULL,
                    display_name TEXT NOT NULL,
                    registered_at TEXT NOT NULL,
                    PRIMARY KEY (session_id, user_id),
                    FOREIGN KEY (session_id) REFERENCES live_sessions(id) ON DELETE CASCADE
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS session_participants (
                    session_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    username TEXT NOT NULL,
                    display_name TEXT NOT NULL,
                    joined_at TEXT NOT NULL,
                    answer_slots INTEGER NOT NULL CHECK (answer_slots > 0),
                    score INTEGER NOT NULL DEFAULT 0 CHECK (score >= 0),
                    PRIMARY KEY (session_id, user_id),
                    FOREIGN KEY (session_id) REFERENCES live_sessions(id) ON DELETE CASCADE
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS participant_answers (
                    session_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    question_index INTEGER NOT NULL CHECK (question_index >= 0),
                    answer_index INTEGER NOT NULL CHECK (answer_index >= 0),
                    points INTEGER NOT NULL CHECK (points >= 0),
                    answered_at TEXT NOT NULL,
                    PRIMARY KEY (session_id, user_id, question_index),
                    FOREIGN KEY (session_id, user_id)
                        REFERENCES session_participants(session_id, user_id) ON DELETE CASCADE
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_live_sessions_status_start
                    ON live_sessions (status, scheduled_start);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_live_sessions_level_start
                    ON live_sessions (level, scheduled_start);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                INSERT INTO schema_migrations (version, applied_at)
                VALUES (?1, ?2)
                ON CONFLICT(version) DO NOTHING
            ",
        )
        .bind(1_i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
    }

    Ok(())
}
