//! Shared error types for the services crate.

use std::fmt;

use thiserror::Error;

use live_core::model::{SessionError, SessionId, SessionStatus, UserId};
use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

use crate::config::ConfigError;

/// Operation attempted against a session, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Register,
    Unregister,
    Join,
    SubmitAnswer,
    Cancel,
    RegenerateQuestions,
    Edit(&'static str),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Register => f.write_str("register"),
            Operation::Unregister => f.write_str("unregister"),
            Operation::Join => f.write_str("join"),
            Operation::SubmitAnswer => f.write_str("submit an answer"),
            Operation::Cancel => f.write_str("cancel"),
            Operation::RegenerateQuestions => f.write_str("regenerate questions"),
            Operation::Edit(field) => write!(f, "edit {field}"),
        }
    }
}

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidTransition,
    AlreadyAnswered,
    CapacityExceeded,
    Unauthorized,
    Validation,
    Conflict,
    Storage,
}

/// Errors emitted by live-session services.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LiveSessionError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("user {user_id} has not joined session {session_id}")]
    ParticipantNotFound {
        session_id: SessionId,
        user_id: UserId,
    },

    #[error("user {user_id} is not registered for session {session_id}")]
    NotRegistered {
        session_id: SessionId,
        user_id: UserId,
    },

    #[error("cannot {operation} while the session is {status}")]
    InvalidTransition {
        operation: Operation,
        status: SessionStatus,
    },

    #[error("question {question_index} was already answered")]
    AlreadyAnswered { question_index: usize, score: u32 },

    #[error("session is full ({max} participants)")]
    CapacityExceeded { max: u32 },

    #[error("{operation} requires an administrator")]
    Unauthorized { operation: &'static str },

    #[error(transparent)]
    Validation(SessionError),

    #[error("session was modified concurrently; reload and retry")]
    Conflict,

    #[error(transparent)]
    Storage(StorageError),
}

impl LiveSessionError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            LiveSessionError::SessionNotFound(_)
            | LiveSessionError::ParticipantNotFound { .. }
            | LiveSessionError::NotRegistered { .. } => ErrorKind::NotFound,
            LiveSessionError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            LiveSessionError::AlreadyAnswered { .. } => ErrorKind::AlreadyAnswered,
            LiveSessionError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            LiveSessionError::Unauthorized { .. } => ErrorKind::Unauthorized,
            LiveSessionError::Validation(_) => ErrorKind::Validation,
            LiveSessionError::Conflict => ErrorKind::Conflict,
            LiveSessionError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Maps a storage error raised while touching `session_id`.
    pub(crate) fn from_storage(err: StorageError, session_id: SessionId) -> Self {
        match err {
            StorageError::NotFound => LiveSessionError::SessionNotFound(session_id),
            StorageError::Conflict => LiveSessionError::Conflict,
            other => LiveSessionError::Storage(other),
        }
    }
}

impl From<SessionError> for LiveSessionError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::FieldLocked { field, status } => LiveSessionError::InvalidTransition {
                operation: Operation::Edit(field),
                status,
            },
            other => LiveSessionError::Validation(other),
        }
    }
}

impl From<StorageError> for LiveSessionError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict => LiveSessionError::Conflict,
            other => LiveSessionError::Storage(other),
        }
    }
}

/// Errors raised while wiring services at startup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LiveServicesInitError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_lock_becomes_invalid_transition() {
        let err = LiveSessionError::from(SessionError::FieldLocked {
            field: "questions",
            status: SessionStatus::Active,
        });
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(err.to_string(), "cannot edit questions while the session is active");
    }

    #[test]
    fn storage_not_found_names_the_session() {
        let id = SessionId::generate();
        let err = LiveSessionError::from_storage(StorageError::NotFound, id);
        assert!(matches!(err, LiveSessionError::SessionNotFound(got) if got == id));
    }
}
