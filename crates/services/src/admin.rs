use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use live_core::Clock;
use live_core::lifecycle::LifecyclePolicy;
use live_core::model::{
    LiveSession, Question, QuestionSelection, SessionDraft, SessionId, SessionPatch,
    SessionStatus, UserProfile,
};
use storage::repository::SessionRepository;

use crate::error::{LiveSessionError, Operation};
use crate::gate::StatusGate;

/// Outcome of a cancel request; repeating it is not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "session", rename_all = "snake_case")]
pub enum Cancellation {
    Cancelled(LiveSession),
    AlreadyCancelled(LiveSession),
}

impl Cancellation {
    #[must_use]
    pub fn session(&self) -> &LiveSession {
        match self {
            Cancellation::Cancelled(s) | Cancellation::AlreadyCancelled(s) => s,
        }
    }
}

/// Administrator-only mutations of session definitions.
#[derive(Clone)]
pub struct SessionAdminService {
    gate: StatusGate,
    sessions: Arc<dyn SessionRepository>,
    default_max_participants: Option<u32>,
}

impl SessionAdminService {
    #[must_use]
    pub fn new(
        clock: Clock,
        policy: LifecyclePolicy,
        sessions: Arc<dyn SessionRepository>,
        default_max_participants: Option<u32>,
    ) -> Self {
        Self {
            gate: StatusGate::new(clock, policy, Arc::clone(&sessions)),
            sessions,
            default_max_participants,
        }
    }

    /// Creates a session in `Scheduled` state.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` for non-admins, `Validation` for a malformed draft.
    pub async fn create_session(
        &self,
        actor: &UserProfile,
        mut draft: SessionDraft,
    ) -> Result<LiveSession, LiveSessionError> {
        require_admin(actor, "create session")?;
        if draft.max_participants.is_none() {
            draft.max_participants = self.default_max_participants;
        }
        let session = LiveSession::create(
            SessionId::generate(),
            draft,
            self.gate.clock().now(),
            self.gate.policy(),
        )?;
        self.sessions.insert_session(&session).await?;
        info!(session_id = %session.id(), actor = %actor.user_id, "session created");
        Ok(session)
    }

    /// Applies `patch` if the session is still at `expected_revision` (when given).
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when the session changed since the caller read it,
    /// `InvalidTransition` when the status locks a patched field, and
    /// `Validation` for bad values.
    pub async fn update_session(
        &self,
        actor: &UserProfile,
        id: SessionId,
        expected_revision: Option<u64>,
        patch: SessionPatch,
    ) -> Result<LiveSession, LiveSessionError> {
        require_admin(actor, "update session")?;
        let mut session = self.gate.load(id).await?;
        check_revision(&session, expected_revision)?;
        if patch.is_empty() {
            return Ok(session);
        }
        session.apply_patch(patch, self.gate.clock().now(), self.gate.policy())?;
        self.persist(session, "session updated", actor).await
    }

    /// Replaces the selected questions while the session is still `Scheduled`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` once the lobby has opened, `Validation` for
    /// a selection that does not fit the question list, and `Conflict` on a
    /// stale revision.
    pub async fn regenerate_questions(
        &self,
        actor: &UserProfile,
        id: SessionId,
        expected_revision: Option<u64>,
        selection: &QuestionSelection,
        replacements: Vec<Question>,
    ) -> Result<LiveSession, LiveSessionError> {
        require_admin(actor, "regenerate questions")?;
        let mut session = self.gate.load(id).await?;
        check_revision(&session, expected_revision)?;
        session
            .regenerate_questions(selection, replacements, self.gate.clock().now(), self.gate.policy())
            .map_err(|err| match LiveSessionError::from(err) {
                LiveSessionError::InvalidTransition { status, .. } => {
                    LiveSessionError::InvalidTransition {
                        operation: Operation::RegenerateQuestions,
                        status,
                    }
                }
                other => other,
            })?;
        self.persist(session, "questions regenerated", actor).await
    }

    /// Sets the terminal cancellation flag.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` for a session that already completed.
    pub async fn cancel_session(
        &self,
        actor: &UserProfile,
        id: SessionId,
    ) -> Result<Cancellation, LiveSessionError> {
        require_admin(actor, "cancel session")?;
        let session = self.gate.load(id).await?;
        match session.cached_status() {
            SessionStatus::Cancelled => {
                debug!(session_id = %id, "session already cancelled");
                return Ok(Cancellation::AlreadyCancelled(session));
            }
            SessionStatus::Completed => {
                return Err(LiveSessionError::InvalidTransition {
                    operation: Operation::Cancel,
                    status: SessionStatus::Completed,
                });
            }
            SessionStatus::Scheduled | SessionStatus::Lobby | SessionStatus::Active => {}
        }

        let changed = self
            .sessions
            .cancel_session(id)
            .await
            .map_err(|err| LiveSessionError::from_storage(err, id))?;
        let session = self.gate.load(id).await?;
        if changed {
            info!(session_id = %id, actor = %actor.user_id, "session cancelled");
            Ok(Cancellation::Cancelled(session))
        } else {
            Ok(Cancellation::AlreadyCancelled(session))
        }
    }

    /// Physically removes a session, its registrations, and its participants.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the id is unknown.
    pub async fn delete_session(
        &self,
        actor: &UserProfile,
        id: SessionId,
    ) -> Result<(), LiveSessionError> {
        require_admin(actor, "delete session")?;
        self.sessions
            .delete_session(id)
            .await
            .map_err(|err| LiveSessionError::from_storage(err, id))?;
        info!(session_id = %id, actor = %actor.user_id, "session deleted");
        Ok(())
    }

    async fn persist(
        &self,
        mut session: LiveSession,
        message: &'static str,
        actor: &UserProfile,
    ) -> Result<LiveSession, LiveSessionError> {
        let id = session.id();
        let revision = self
            .sessions
            .update_session(&session)
            .await
            .map_err(|err| LiveSessionError::from_storage(err, id))?;
        session.set_revision(revision);
        info!(session_id = %id, actor = %actor.user_id, revision, "{message}");
        Ok(session)
    }
}

fn require_admin(actor: &UserProfile, operation: &'static str) -> Result<(), LiveSessionError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(LiveSessionError::Unauthorized { operation })
    }
}

fn check_revision(session: &LiveSession, expected: Option<u64>) -> Result<(), LiveSessionError> {
    match expected {
        Some(revision) if revision != session.revision() => Err(LiveSessionError::Conflict),
        _ => Ok(()),
    }
}
