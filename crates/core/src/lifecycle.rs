//! Status transition engine.
//!
//! A session's status is a pure function of its schedule, its cancellation
//! flag, and the current time. The status stored alongside a session is only
//! a cache of this function's output and is refreshed lazily on access.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{SessionError, SessionStatus};

/// Default time before the scheduled start at which the lobby opens.
pub const DEFAULT_LOBBY_LEAD_MINUTES: i64 = 5;

/// Timing knobs shared by every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecyclePolicy {
    lobby_lead: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            lobby_lead: Duration::minutes(DEFAULT_LOBBY_LEAD_MINUTES),
        }
    }
}

impl LifecyclePolicy {
    /// Creates a policy with a custom lobby lead.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidLobbyLead` if the lead is negative.
    pub fn new(lobby_lead: Duration) -> Result<Self, SessionError> {
        if lobby_lead < Duration::zero() {
            return Err(SessionError::InvalidLobbyLead);
        }
        Ok(Self { lobby_lead })
    }

    #[must_use]
    pub fn lobby_lead(&self) -> Duration {
        self.lobby_lead
    }

    #[must_use]
    pub fn lobby_opens_at(&self, scheduled_start: DateTime<Utc>) -> DateTime<Utc> {
        scheduled_start - self.lobby_lead
    }
}

/// End of the active window for a session.
#[must_use]
pub fn ends_at(scheduled_start: DateTime<Utc>, duration_minutes: u32) -> DateTime<Utc> {
    scheduled_start + Duration::minutes(i64::from(duration_minutes))
}

/// Computes the logical status of a session at `now`.
///
/// Windows are half-open: the lobby covers `[lobby_open, start)`, the active
/// phase covers `[start, end)`. Cancellation wins over any time-derived value.
#[must_use]
pub fn resolve_status(
    scheduled_start: DateTime<Utc>,
    duration_minutes: u32,
    cancelled: bool,
    now: DateTime<Utc>,
    policy: &LifecyclePolicy,
) -> SessionStatus {
    if cancelled {
        return SessionStatus::Cancelled;
    }
    if now < policy.lobby_opens_at(scheduled_start) {
        SessionStatus::Scheduled
    } else if now < scheduled_start {
        SessionStatus::Lobby
    } else if now < ends_at(scheduled_start, duration_minutes) {
        SessionStatus::Active
    } else {
        SessionStatus::Completed
    }
}

/// A change of the cached status that must be written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

/// Decides whether the cached status needs a write-back.
///
/// Returns `None` when the cache is already current, and also when the
/// computed value would move the cache backwards (a caller with a lagging
/// clock); the sequence never regresses once persisted.
#[must_use]
pub fn plan_transition(cached: SessionStatus, computed: SessionStatus) -> Option<StatusTransition> {
    if cached == computed || cached == SessionStatus::Cancelled {
        return None;
    }
    if let (Some(from), Some(to)) = (cached.phase_rank(), computed.phase_rank()) {
        if to < from {
            return None;
        }
    }
    Some(StatusTransition {
        from: cached,
        to: computed,
    })
}

/// Checks that a (re)scheduled start still leaves the session `Scheduled` at `now`.
///
/// An administrator may opt out with `allow_immediate`, for sessions meant to
/// open their lobby or start right away.
///
/// # Errors
///
/// Returns `SessionError::StartTooSoon` when the lobby would already be open.
pub fn validate_schedule(
    scheduled_start: DateTime<Utc>,
    now: DateTime<Utc>,
    policy: &LifecyclePolicy,
    allow_immediate: bool,
) -> Result<(), SessionError> {
    let lobby_opens_at = policy.lobby_opens_at(scheduled_start);
    if !allow_immediate && now >= lobby_opens_at {
        return Err(SessionError::StartTooSoon { lobby_opens_at });
    }
    Ok(())
}
