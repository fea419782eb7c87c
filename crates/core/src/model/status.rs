use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Logical lifecycle status of a live session.
///
/// Non-cancelled sessions only ever move forward:
/// `Scheduled -> Lobby -> Active -> Completed`. `Cancelled` is terminal and
/// overrides the time-derived value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Scheduled,
    Lobby,
    Active,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 5] = [
        SessionStatus::Scheduled,
        SessionStatus::Lobby,
        SessionStatus::Active,
        SessionStatus::Completed,
        SessionStatus::Cancelled,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Lobby => "lobby",
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    /// Position in the forward-only time sequence.
    ///
    /// Returns `None` for `Cancelled`, which sits outside the sequence.
    #[must_use]
    pub fn phase_rank(self) -> Option<u8> {
        match self {
            SessionStatus::Scheduled => Some(0),
            SessionStatus::Lobby => Some(1),
            SessionStatus::Active => Some(2),
            SessionStatus::Completed => Some(3),
            SessionStatus::Cancelled => None,
        }
    }

    /// True for statuses no further transition can leave.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }

    /// Registration and unregistration are open.
    #[must_use]
    pub fn accepts_registration(self) -> bool {
        matches!(self, SessionStatus::Scheduled | SessionStatus::Lobby)
    }

    /// Participants may join.
    #[must_use]
    pub fn accepts_join(self) -> bool {
        matches!(self, SessionStatus::Lobby | SessionStatus::Active)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStatusError(String);

impl fmt::Display for ParseStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid session status: {}", self.0)
    }
}

impl std::error::Error for ParseStatusError {}

impl FromStr for SessionStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(SessionStatus::Scheduled),
            "lobby" => Ok(SessionStatus::Lobby),
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            other => Err(ParseStatusError(other.to_owned())),
        }
    }
}
