//! Lazy status refresh: every read path goes through here before trusting
//! a session's cached status.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use live_core::Clock;
use live_core::lifecycle::{LifecyclePolicy, StatusTransition};
use live_core::model::{LiveSession, SessionId};
use storage::repository::{SessionFilter, SessionRepository};

use crate::error::LiveSessionError;

/// A cached status that was brought up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AppliedTransition {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub transition: StatusTransition,
}

/// Summary of one refresh pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub examined: usize,
    pub transitions: Vec<AppliedTransition>,
    /// Write-backs another caller had already performed.
    pub contended: usize,
    /// Sessions skipped because they could not be loaded or written back.
    pub failed: usize,
}

#[derive(Clone)]
pub struct StatusGate {
    clock: Clock,
    policy: LifecyclePolicy,
    sessions: Arc<dyn SessionRepository>,
}

impl StatusGate {
    #[must_use]
    pub fn new(clock: Clock, policy: LifecyclePolicy, sessions: Arc<dyn SessionRepository>) -> Self {
        Self {
            clock,
            policy,
            sessions,
        }
    }

    #[must_use]
    pub fn clock(&self) -> Clock {
        self.clock
    }

    #[must_use]
    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    /// Loads a session and brings its cached status up to date.
    ///
    /// # Errors
    ///
    /// Returns `LiveSessionError::SessionNotFound` if the id is unknown, or a
    /// storage error.
    pub async fn load(&self, id: SessionId) -> Result<LiveSession, LiveSessionError> {
        let mut session = self
            .sessions
            .get_session(id)
            .await
            .map_err(|err| LiveSessionError::from_storage(err, id))?
            .ok_or(LiveSessionError::SessionNotFound(id))?;
        self.refresh(&mut session).await?;
        Ok(session)
    }

    /// Refreshes every session matching `filter` and returns them with
    /// current statuses, plus what changed.
    ///
    /// A session that cannot be loaded or written back is logged, counted in
    /// `RefreshReport::failed`, and left out; the others are still returned.
    ///
    /// # Errors
    ///
    /// Returns a storage error only if the listing itself fails.
    pub async fn load_all(
        &self,
        filter: &SessionFilter,
    ) -> Result<(Vec<LiveSession>, RefreshReport), LiveSessionError> {
        let listing = self.sessions.list_sessions(filter).await?;
        let mut report = RefreshReport {
            examined: listing.sessions.len() + listing.unreadable.len(),
            failed: listing.unreadable.len(),
            ..RefreshReport::default()
        };
        for unreadable in &listing.unreadable {
            warn!(session_id = %unreadable.id, error = %unreadable.error, "skipping unreadable session");
        }

        let mut sessions = Vec::with_capacity(listing.sessions.len());
        for mut session in listing.sessions {
            match self.refresh(&mut session).await {
                Ok(Some((transition, true))) => report.transitions.push(AppliedTransition {
                    session_id: session.id(),
                    transition,
                }),
                Ok(Some((_, false))) => report.contended += 1,
                Ok(None) => {}
                Err(err) => {
                    warn!(session_id = %session.id(), error = %err, "skipping session after failed write-back");
                    report.failed += 1;
                    continue;
                }
            }
            sessions.push(session);
        }
        Ok((sessions, report))
    }

    /// Recomputes `session`'s status and writes it back if it moved forward.
    ///
    /// Returns the transition and whether this caller's write landed.
    async fn refresh(
        &self,
        session: &mut LiveSession,
    ) -> Result<Option<(StatusTransition, bool)>, LiveSessionError> {
        let Some(transition) = session.refresh_status(self.clock.now(), &self.policy) else {
            return Ok(None);
        };
        let id = session.id();
        let landed = self
            .sessions
            .write_back_status(id, transition.from, transition.to)
            .await
            .map_err(|err| LiveSessionError::from_storage(err, id))?;
        if landed {
            debug!(session_id = %id, from = %transition.from, to = %transition.to, "status written back");
        } else {
            warn!(session_id = %id, from = %transition.from, to = %transition.to, "status write-back lost the race");
        }
        Ok(Some((transition, landed)))
    }
}
