//! Adaptive polling cadence for clients without a push channel.
//!
//! Clients pick the tightest interval that applies to what they display so a
//! lobby or active boundary is never observed more than one interval late.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::lifecycle::LifecyclePolicy;
use crate::model::{LiveSession, SessionStatus};

/// What a client knows about one displayed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub lobby_opens_at: DateTime<Utc>,
}

impl SessionSnapshot {
    #[must_use]
    pub fn of(session: &LiveSession, policy: &LifecyclePolicy) -> Self {
        Self {
            status: session.cached_status(),
            lobby_opens_at: session.lobby_opens_at(policy),
        }
    }
}

/// Interval table for list and detail views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicy {
    pub active_list: Duration,
    pub lobby_list: Duration,
    pub imminent_list: Duration,
    pub idle_list: Duration,
    pub active_detail: Duration,
    pub lobby_detail: Duration,
    /// A scheduled session whose lobby opens within this window is "imminent".
    pub imminent_window: Duration,
    /// Repeated refreshes of the same view inside this window share one fetch.
    pub dedup_window: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            active_list: Duration::from_secs(5),
            lobby_list: Duration::from_secs(10),
            imminent_list: Duration::from_secs(15),
            idle_list: Duration::from_secs(30),
            active_detail: Duration::from_secs(5),
            lobby_detail: Duration::from_secs(10),
            imminent_window: Duration::from_secs(5 * 60),
            dedup_window: Duration::from_secs(20),
        }
    }
}

impl SyncPolicy {
    /// Interval for a list view, chosen by the tightest applicable row.
    #[must_use]
    pub fn list_interval(&self, sessions: &[SessionSnapshot], now: DateTime<Utc>) -> Duration {
        sessions
            .iter()
            .filter_map(|s| self.interval_for(s, now))
            .min()
            .unwrap_or(self.idle_list)
    }

    /// Interval for a single-session detail view.
    ///
    /// Returns `None` once the session is terminal: nothing left to observe.
    #[must_use]
    pub fn detail_interval(&self, session: &SessionSnapshot, now: DateTime<Utc>) -> Option<Duration> {
        match session.status {
            SessionStatus::Active => Some(self.active_detail),
            SessionStatus::Lobby => Some(self.lobby_detail),
            SessionStatus::Scheduled => Some(
                self.interval_for(session, now)
                    .unwrap_or(self.idle_list),
            ),
            SessionStatus::Completed | SessionStatus::Cancelled => None,
        }
    }

    fn interval_for(&self, session: &SessionSnapshot, now: DateTime<Utc>) -> Option<Duration> {
        match session.status {
            SessionStatus::Active => Some(self.active_list),
            SessionStatus::Lobby => Some(self.lobby_list),
            SessionStatus::Scheduled if self.is_imminent(session.lobby_opens_at, now) => {
                Some(self.imminent_list)
            }
            _ => None,
        }
    }

    fn is_imminent(&self, lobby_opens_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let until_lobby = lobby_opens_at - now;
        match until_lobby.to_std() {
            Ok(remaining) => remaining < self.imminent_window,
            // Already past the lobby time: the cached status is stale.
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;
    use chrono::Duration as ChronoDuration;

    fn snap(status: SessionStatus, lobby_in_minutes: i64) -> SessionSnapshot {
        SessionSnapshot {
            status,
            lobby_opens_at: fixed_now() + ChronoDuration::minutes(lobby_in_minutes),
        }
    }

    #[test]
    fn empty_list_polls_slowly() {
        let policy = SyncPolicy::default();
        assert_eq!(policy.list_interval(&[], fixed_now()), Duration::from_secs(30));
    }

    #[test]
    fn far_future_and_finished_sessions_poll_slowly() {
        let policy = SyncPolicy::default();
        let list = [
            snap(SessionStatus::Scheduled, 120),
            snap(SessionStatus::Completed, -300),
            snap(SessionStatus::Cancelled, 10),
        ];
        assert_eq!(policy.list_interval(&list, fixed_now()), Duration::from_secs(30));
    }

    #[test]
    fn imminent_lobby_tightens_to_fifteen_seconds() {
        let policy = SyncPolicy::default();
        let list = [snap(SessionStatus::Scheduled, 120), snap(SessionStatus::Scheduled, 4)];
        assert_eq!(policy.list_interval(&list, fixed_now()), Duration::from_secs(15));
    }

    #[test]
    fn tightest_row_wins() {
        let policy = SyncPolicy::default();
        let lobby = [snap(SessionStatus::Scheduled, 2), snap(SessionStatus::Lobby, -1)];
        assert_eq!(policy.list_interval(&lobby, fixed_now()), Duration::from_secs(10));

        let active = [snap(SessionStatus::Lobby, -1), snap(SessionStatus::Active, -10)];
        assert_eq!(policy.list_interval(&active, fixed_now()), Duration::from_secs(5));
    }

    #[test]
    fn stale_scheduled_snapshot_counts_as_imminent() {
        let policy = SyncPolicy::default();
        let list = [snap(SessionStatus::Scheduled, -1)];
        assert_eq!(policy.list_interval(&list, fixed_now()), Duration::from_secs(15));
    }

    #[test]
    fn detail_view_intervals() {
        let policy = SyncPolicy::default();
        let now = fixed_now();
        assert_eq!(
            policy.detail_interval(&snap(SessionStatus::Active, -10), now),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            policy.detail_interval(&snap(SessionStatus::Lobby, -1), now),
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            policy.detail_interval(&snap(SessionStatus::Scheduled, 60), now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(policy.detail_interval(&snap(SessionStatus::Completed, -60), now), None);
    }
}
