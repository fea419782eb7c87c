use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use live_core::Clock;
use live_core::lifecycle::LifecyclePolicy;
use live_core::model::{
    LiveSession, Participant, Registration, RegistrationWrite, SessionId, SessionStatus, UserId,
    UserProfile,
};
use storage::repository::{JoinWrite, ParticipantRepository, SessionRepository};

use crate::error::{LiveSessionError, Operation};
use crate::gate::StatusGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationOutcome {
    Registered,
    AlreadyRegistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Unregistration {
    Removed,
    NotRegistered,
}

/// Tagged join result: created now, or the record from an earlier join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "participant", rename_all = "snake_case")]
pub enum JoinOutcome {
    Joined(Participant),
    AlreadyJoined(Participant),
}

impl JoinOutcome {
    #[must_use]
    pub fn participant(&self) -> &Participant {
        match self {
            JoinOutcome::Joined(p) | JoinOutcome::AlreadyJoined(p) => p,
        }
    }

    #[must_use]
    pub fn into_participant(self) -> Participant {
        match self {
            JoinOutcome::Joined(p) | JoinOutcome::AlreadyJoined(p) => p,
        }
    }
}


/// Admission control: the interest list and promotion to participant.
#[derive(Clone)]
pub struct ParticipantRegistry {
    gate: StatusGate,
    participants: Arc<dyn ParticipantRepository>,
}

impl ParticipantRegistry {
    #[must_use]
    pub fn new(
        clock: Clock,
        policy: LifecyclePolicy,
        sessions: Arc<dyn SessionRepository>,
        participants: Arc<dyn ParticipantRepository>,
    ) -> Self {
        Self {
            gate: StatusGate::new(clock, policy, sessions),
            participants,
        }
    }

    /// Adds `user` to the interest list. Registering twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the session is `Scheduled` or
    /// `Lobby`, and `CapacityExceeded` when the cap is reached.
    pub async fn register(
        &self,
        id: SessionId,
        user: &UserProfile,
    ) -> Result<RegistrationOutcome, LiveSessionError> {
        let session = self.gate.load(id).await?;
        ensure(&session, Operation::Register, SessionStatus::accepts_registration)?;
        let outcome = self.write_registration(id, user, Operation::Register).await?;
        match outcome {
            RegistrationOutcome::Registered => {
                info!(session_id = %id, user_id = %user.user_id, "registered");
            }
            RegistrationOutcome::AlreadyRegistered => {
                debug!(session_id = %id, user_id = %user.user_id, "already registered");
            }
        }
        Ok(outcome)
    }

    /// Removes `user_id` from the interest list. Absent users are a no-op.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` once the session has started.
    pub async fn unregister(
        &self,
        id: SessionId,
        user_id: &UserId,
    ) -> Result<Unregistration, LiveSessionError> {
        let session = self.gate.load(id).await?;
        ensure(&session, Operation::Unregister, SessionStatus::accepts_registration)?;
        let removed = self
            .participants
            .unregister(id, user_id)
            .await
            .map_err(|err| LiveSessionError::from_storage(err, id))?;
        if removed {
            info!(session_id = %id, %user_id, "unregistered");
            Ok(Unregistration::Removed)
        } else {
            debug!(session_id = %id, %user_id, "unregister of absent user");
            Ok(Unregistration::NotRegistered)
        }
    }

    /// Promotes `user` to participant with one empty answer slot per question.
    ///
    /// Re-joining returns the existing record unchanged.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the session is `Lobby` or `Active`,
    /// `NotRegistered` when enrollment is closed and the user never
    /// registered, and `CapacityExceeded` when open enrollment hits the cap.
    pub async fn join(
        &self,
        id: SessionId,
        user: &UserProfile,
    ) -> Result<JoinOutcome, LiveSessionError> {
        let session = self.gate.load(id).await?;
        ensure(&session, Operation::Join, SessionStatus::accepts_join)?;

        if let Some(existing) = session.participant(&user.user_id) {
            debug!(session_id = %id, user_id = %user.user_id, "already joined");
            return Ok(JoinOutcome::AlreadyJoined(existing.clone()));
        }
        if !session.is_registered(&user.user_id) {
            if !session.open_enrollment() {
                return Err(LiveSessionError::NotRegistered {
                    session_id: id,
                    user_id: user.user_id.clone(),
                });
            }
            self.write_registration(id, user, Operation::Join).await?;
        }

        let write = self
            .participants
            .join(id, user, self.gate.clock().now())
            .await
            .map_err(|err| LiveSessionError::from_storage(err, id))?;
        let outcome = match write {
            JoinWrite::Joined(p) => JoinOutcome::Joined(p),
            JoinWrite::AlreadyJoined(p) => JoinOutcome::AlreadyJoined(p),
            JoinWrite::Closed { status } => {
                debug!(session_id = %id, %status, "join refused by stored status");
                return Err(LiveSessionError::InvalidTransition {
                    operation: Operation::Join,
                    status,
                });
            }
        };
        if let JoinOutcome::Joined(participant) = &outcome {
            info!(
                session_id = %id,
                user_id = %user.user_id,
                slots = participant.answers().len(),
                "joined"
            );
        }
        Ok(outcome)
    }

    /// # Errors
    ///
    /// Returns `ParticipantNotFound` if `user_id` never joined.
    pub async fn get_my_participation(
        &self,
        id: SessionId,
        user_id: &UserId,
    ) -> Result<Participant, LiveSessionError> {
        self.gate.load(id).await?;
        self.participants
            .get_participant(id, user_id)
            .await
            .map_err(|err| LiveSessionError::from_storage(err, id))?
            .ok_or_else(|| LiveSessionError::ParticipantNotFound {
                session_id: id,
                user_id: user_id.clone(),
            })
    }

    /// # Errors
    ///
    /// Returns `SessionNotFound` if the id is unknown.
    pub async fn list_registrations(
        &self,
        id: SessionId,
    ) -> Result<Vec<Registration>, LiveSessionError> {
        self.gate.load(id).await?;
        self.participants
            .list_registrations(id)
            .await
            .map_err(|err| LiveSessionError::from_storage(err, id))
    }

    async fn write_registration(
        &self,
        id: SessionId,
        user: &UserProfile,
        operation: Operation,
    ) -> Result<RegistrationOutcome, LiveSessionError> {
        let write = self
            .participants
            .register(id, user, self.gate.clock().now())
            .await
            .map_err(|err| LiveSessionError::from_storage(err, id))?;
        match write {
            RegistrationWrite::Registered => Ok(RegistrationOutcome::Registered),
            RegistrationWrite::AlreadyRegistered => Ok(RegistrationOutcome::AlreadyRegistered),
            RegistrationWrite::CapacityExceeded { max } => {
                Err(LiveSessionError::CapacityExceeded { max })
            }
            RegistrationWrite::Closed { status } => {
                Err(LiveSessionError::InvalidTransition { operation, status })
            }
        }
    }
}

fn ensure(
    session: &LiveSession,
    operation: Operation,
    allowed: fn(SessionStatus) -> bool,
) -> Result<(), LiveSessionError> {
    let status = session.cached_status();
    if allowed(status) {
        Ok(())
    } else {
        Err(LiveSessionError::InvalidTransition { operation, status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use live_core::model::{Question, SessionDraft};
    use live_core::time::fixed_now;
    use storage::repository::Storage;

    use crate::error::ErrorKind;

    fn user(id: &str) -> UserProfile {
        UserProfile::student(UserId::new(id).unwrap(), id, id.to_uppercase())
    }

    async fn seed(storage: &Storage, max: Option<u32>, open: bool) -> SessionId {
        let draft = SessionDraft {
            name: "Listening sprint".into(),
            description: None,
            level: "A2".into(),
            scheduled_start: fixed_now() + Duration::minutes(30),
            duration_minutes: 20,
            questions: vec![Question::new("q-1", 0), Question::new("q-2", 1)],
            max_participants: max,
            open_enrollment: open,
            allow_immediate: false,
        };
        let session = LiveSession::create(
            SessionId::generate(),
            draft,
            fixed_now(),
            &LifecyclePolicy::default(),
        )
        .unwrap();
        storage.sessions.insert_session(&session).await.unwrap();
        session.id()
    }

    fn registry(storage: &Storage, offset: Duration) -> ParticipantRegistry {
        ParticipantRegistry::new(
            Clock::fixed(fixed_now() + offset),
            LifecyclePolicy::default(),
            Arc::clone(&storage.sessions),
            Arc::clone(&storage.participants),
        )
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let storage = Storage::in_memory();
        let id = seed(&storage, None, false).await;
        let reg = registry(&storage, Duration::zero());

        assert_eq!(reg.register(id, &user("ana")).await.unwrap(), RegistrationOutcome::Registered);
        assert_eq!(
            reg.register(id, &user("ana")).await.unwrap(),
            RegistrationOutcome::AlreadyRegistered
        );
        assert_eq!(reg.list_registrations(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let storage = Storage::in_memory();
        let id = seed(&storage, Some(1), false).await;
        let reg = registry(&storage, Duration::zero());

        reg.register(id, &user("ana")).await.unwrap();
        let err = reg.register(id, &user("ben")).await.unwrap_err();
        assert!(matches!(err, LiveSessionError::CapacityExceeded { max: 1 }));
    }

    #[tokio::test]
    async fn unregister_absent_user_is_a_no_op_until_start() {
        let storage = Storage::in_memory();
        let id = seed(&storage, None, false).await;
        let reg = registry(&storage, Duration::zero());

        reg.register(id, &user("ana")).await.unwrap();
        assert_eq!(
            reg.unregister(id, &user("ana").user_id).await.unwrap(),
            Unregistration::Removed
        );
        assert_eq!(
            reg.unregister(id, &user("ana").user_id).await.unwrap(),
            Unregistration::NotRegistered
        );

        let started = registry(&storage, Duration::minutes(31));
        let err = started.unregister(id, &user("ana").user_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }

    #[tokio::test]
    async fn join_requires_registration_unless_open() {
        let storage = Storage::in_memory();
        let closed = seed(&storage, None, false).await;
        let open = seed(&storage, Some(1), true).await;
        let lobby = registry(&storage, Duration::minutes(27));

        let err = lobby.join(closed, &user("ana")).await.unwrap_err();
        assert!(matches!(err, LiveSessionError::NotRegistered { .. }));

        let joined = lobby.join(open, &user("ana")).await.unwrap();
        assert!(matches!(joined, JoinOutcome::Joined(_)));
        assert_eq!(joined.participant().answers(), &[None, None]);
        assert!(lobby.list_registrations(open).await.unwrap().len() == 1);

        let err = lobby.join(open, &user("ben")).await.unwrap_err();
        assert!(matches!(err, LiveSessionError::CapacityExceeded { max: 1 }));
    }

    #[tokio::test]
    async fn join_before_lobby_is_rejected() {
        let storage = Storage::in_memory();
        let id = seed(&storage, None, true).await;
        let err = registry(&storage, Duration::zero())
            .join(id, &user("ana"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LiveSessionError::InvalidTransition {
                operation: Operation::Join,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn participation_lookup_distinguishes_missing_participant() {
        let storage = Storage::in_memory();
        let id = seed(&storage, None, true).await;
        let reg = registry(&storage, Duration::minutes(28));
        reg.join(id, &user("ana")).await.unwrap();

        let me = reg.get_my_participation(id, &user("ana").user_id).await.unwrap();
        assert_eq!(me.score(), 0);
        let err = reg
            .get_my_participation(id, &user("ben").user_id)
            .await
            .unwrap_err();
        assert!(matches!(err, LiveSessionError::ParticipantNotFound { .. }));
    }
}
