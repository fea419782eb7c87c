use std::sync::Arc;

use live_core::Clock;
use live_core::lifecycle::LifecyclePolicy;
use live_core::model::{LiveSession, SessionId};
use storage::repository::{SessionFilter, SessionRepository};

use crate::error::LiveSessionError;
use crate::gate::{RefreshReport, StatusGate};

/// Read side of the session catalog. Every read refreshes statuses first.
#[derive(Clone)]
pub struct CatalogService {
    gate: StatusGate,
}

impl CatalogService {
    #[must_use]
    pub fn new(clock: Clock, policy: LifecyclePolicy, sessions: Arc<dyn SessionRepository>) -> Self {
        Self {
            gate: StatusGate::new(clock, policy, sessions),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &LifecyclePolicy {
        self.gate.policy()
    }

    /// Lists sessions matching `filter`, ordered by scheduled start.
    ///
    /// Statuses are refreshed before the status filter is applied, so a
    /// session that just crossed into the lobby is listed as `lobby`. A
    /// session that cannot be loaded is logged and left out.
    ///
    /// # Errors
    ///
    /// Returns `LiveSessionError::Storage` if the backend fails.
    pub async fn list_sessions(
        &self,
        filter: &SessionFilter,
    ) -> Result<Vec<LiveSession>, LiveSessionError> {
        let candidates = SessionFilter {
            status: None,
            level: filter.level.clone(),
        };
        let (mut sessions, _) = self.gate.load_all(&candidates).await?;
        sessions.retain(|session| filter.matches(session));
        Ok(sessions)
    }

    /// # Errors
    ///
    /// Returns `LiveSessionError::SessionNotFound` if the id is unknown.
    pub async fn get_session(&self, id: SessionId) -> Result<LiveSession, LiveSessionError> {
        self.gate.load(id).await
    }

    /// Runs the lazy transition step over every session. Sessions that fail
    /// to load or write back are counted in `RefreshReport::failed`.
    ///
    /// # Errors
    ///
    /// Returns `LiveSessionError::Storage` if the backend fails.
    pub async fn refresh_statuses(&self) -> Result<RefreshReport, LiveSessionError> {
        let (_, report) = self.gate.load_all(&SessionFilter::default()).await?;
        Ok(report)
    }
}
