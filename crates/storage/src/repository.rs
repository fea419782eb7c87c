use async_trait::async_trait;
use chrono::{DateTime, Utc};
use live_core::model::{
    LiveSession, Participant, Registration, RegistrationWrite, SessionId, SessionStatus, SlotWrite,
    UserId, UserProfile,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Optional filters for listing sessions. Matches against the cached status,
/// so callers refresh statuses before listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub level: Option<String>,
}

impl SessionFilter {
    #[must_use]
    pub fn matches(&self, session: &LiveSession) -> bool {
        self.status.is_none_or(|s| session.cached_status() == s)
            && self.level.as_deref().is_none_or(|l| session.level() == l)
    }
}

/// A stored session that could not be rebuilt, reported by listings
/// instead of failing them.
#[derive(Debug)]
pub struct UnreadableSession {
    pub id: String,
    pub error: StorageError,
}

/// Sessions returned by a listing, plus the rows that failed to load.
#[derive(Debug, Default)]
pub struct SessionListing {
    pub sessions: Vec<LiveSession>,
    pub unreadable: Vec<UnreadableSession>,
}

/// Outcome of an idempotent join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinWrite {
    Joined(Participant),
    AlreadyJoined(Participant),
    /// The stored session is no longer open for joining.
    Closed { status: SessionStatus },
}

impl JoinWrite {
    #[must_use]
    pub fn participant(&self) -> Option<&Participant> {
        match self {
            JoinWrite::Joined(p) | JoinWrite::AlreadyJoined(p) => Some(p),
            JoinWrite::Closed { .. } => None,
        }
    }
}

/// A first-write-wins answer write, keyed by `(session_id, user_id, question_index)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerSubmission {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub question_index: usize,
    pub answer_index: u32,
    /// Score increment, computed once by the caller at write time.
    pub points: u32,
    pub answered_at: DateTime<Utc>,
}

/// Outcome of an atomic answer write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerWrite {
    Recorded { score: u32 },
    AlreadyAnswered { score: u32 },
    OutOfRange { slots: usize },
    NotJoined,
    /// The stored session is no longer active.
    Closed { status: SessionStatus },
}

/// Repository contract for session records.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Persist a newly created session.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` if the id is already taken.
    async fn insert_session(&self, session: &LiveSession) -> Result<(), StorageError>;

    /// Fetch a session with its registrations and participants.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend fails; a missing id is `Ok(None)`.
    async fn get_session(&self, id: SessionId) -> Result<Option<LiveSession>, StorageError>;

    /// List sessions matching `filter`, ordered by scheduled start.
    ///
    /// A row that cannot be rebuilt lands in `SessionListing::unreadable`
    /// and the rest of the listing still succeeds.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the listing query itself fails.
    async fn list_sessions(&self, filter: &SessionFilter) -> Result<SessionListing, StorageError>;

    /// Persist the editable definition of `session` if its revision is still current.
    ///
    /// Returns the new revision. The write is also refused when the stored
    /// state has moved on in ways the revision does not track: questions
    /// changing after the lobby opened or someone joined, or a cap below the
    /// registrations stored since the caller read the session.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` if another writer got there first or
    /// the stored state refuses the edit, `StorageError::NotFound` if the
    /// session is gone.
    async fn update_session(&self, session: &LiveSession) -> Result<u64, StorageError>;

    /// Compare-and-set of the cached status.
    ///
    /// Returns `false` when the stored status no longer equals `expected`
    /// (another caller already wrote it back).
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend fails.
    async fn write_back_status(
        &self,
        id: SessionId,
        expected: SessionStatus,
        computed: SessionStatus,
    ) -> Result<bool, StorageError>;

    /// Sets the terminal cancellation flag. Returns `false` if already cancelled.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the session does not exist.
    async fn cancel_session(&self, id: SessionId) -> Result<bool, StorageError>;

    /// Physically removes a session and everything embedded in it.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the session does not exist.
    async fn delete_session(&self, id: SessionId) -> Result<(), StorageError>;
}

/// Repository contract for a session's interest list and participants.
#[async_trait]
pub trait ParticipantRepository: Send + Sync {
    /// Atomically check the session's cap and add `user` to its interest
    /// list. Refused once the stored session is completed or cancelled; the
    /// narrower registration window is the caller's check, since open
    /// enrollment registers on join while `Active`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the session does not exist.
    async fn register(
        &self,
        id: SessionId,
        user: &UserProfile,
        at: DateTime<Utc>,
    ) -> Result<RegistrationWrite, StorageError>;

    /// Returns whether the user was on the interest list.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend fails.
    async fn unregister(&self, id: SessionId, user_id: &UserId) -> Result<bool, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the backend fails.
    async fn list_registrations(&self, id: SessionId) -> Result<Vec<Registration>, StorageError>;

    /// Insert a participant with one empty slot per question, or return the
    /// existing record untouched. Refused unless the stored status is
    /// `Lobby` or `Active`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the session does not exist.
    async fn join(
        &self,
        id: SessionId,
        user: &UserProfile,
        at: DateTime<Utc>,
    ) -> Result<JoinWrite, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the backend fails.
    async fn get_participant(
        &self,
        id: SessionId,
        user_id: &UserId,
    ) -> Result<Option<Participant>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the backend fails.
    async fn list_participants(&self, id: SessionId) -> Result<Vec<Participant>, StorageError>;
}

#[async_trait]
pub trait AnswerRepository: Send + Sync {
    /// Record an answer only if its slot is empty and the stored session is
    /// still `Active`, adding `points` to the participant's score in the same
    /// atomic step.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend fails.
    async fn record_answer(&self, submission: &AnswerSubmission) -> Result<AnswerWrite, StorageError>;
}

/// In-memory repository for tests and prototyping.
///
/// Every operation runs inside a single critical section, which gives the
/// same atomicity the `SQLite` backend gets from single statements.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    sessions: Arc<Mutex<HashMap<SessionId, LiveSession>>>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn with_sessions<T>(
        &self,
        f: impl FnOnce(&mut HashMap<SessionId, LiveSession>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut guard = self
            .sessions
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        f(&mut guard)
    }

    fn with_session<T>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut LiveSession) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        self.with_sessions(|sessions| {
            let session = sessions.get_mut(&id).ok_or(StorageError::NotFound)?;
            f(session)
        })
    }
}

#[async_trait]
impl SessionRepository for InMemoryRepository {
    async fn insert_session(&self, session: &LiveSession) -> Result<(), StorageError> {
        self.with_sessions(|sessions| {
            if sessions.contains_key(&session.id()) {
                return Err(StorageError::Conflict);
            }
            sessions.insert(session.id(), session.clone());
            Ok(())
        })
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<LiveSession>, StorageError> {
        self.with_sessions(|sessions| Ok(sessions.get(&id).cloned()))
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> Result<SessionListing, StorageError> {
        self.with_sessions(|sessions| {
            let mut out: Vec<LiveSession> = sessions
                .values()
                .filter(|s| filter.matches(s))
                .cloned()
                .collect();
            out.sort_by_key(|s| (s.scheduled_start(), s.id()));
            Ok(SessionListing {
                sessions: out,
                unreadable: Vec::new(),
            })
        })
    }

    async fn update_session(&self, session: &LiveSession) -> Result<u64, StorageError> {
        self.with_session(session.id(), |stored| {
            if stored.revision() != session.revision() {
                return Err(StorageError::Conflict);
            }
            let questions_frozen = stored.cached_status() != SessionStatus::Scheduled
                || stored.participant_count() > 0;
            if questions_frozen && stored.questions() != session.questions() {
                return Err(StorageError::Conflict);
            }
            if let Some(max) = session.max_participants() {
                if stored.registrations().len() > usize::try_from(max).unwrap_or(usize::MAX) {
                    return Err(StorageError::Conflict);
                }
            }
            stored.copy_definition_from(session);
            let next = stored.revision() + 1;
            stored.set_revision(next);
            Ok(next)
        })
    }

    async fn write_back_status(
        &self,
        id: SessionId,
        expected: SessionStatus,
        computed: SessionStatus,
    ) -> Result<bool, StorageError> {
        self.with_session(id, |stored| {
            if stored.cached_status() != expected {
                return Ok(false);
            }
            stored.set_cached_status(computed);
            Ok(true)
        })
    }

    async fn cancel_session(&self, id: SessionId) -> Result<bool, StorageError> {
        self.with_session(id, |stored| {
            let changed = stored.cancel();
            if changed {
                let next = stored.revision() + 1;
                stored.set_revision(next);
            }
            Ok(changed)
        })
    }

    async fn delete_session(&self, id: SessionId) -> Result<(), StorageError> {
        self.with_sessions(|sessions| {
            sessions.remove(&id).map(|_| ()).ok_or(StorageError::NotFound)
        })
    }
}

#[async_trait]
impl ParticipantRepository for InMemoryRepository {
    async fn register(
        &self,
        id: SessionId,
        user: &UserProfile,
        at: DateTime<Utc>,
    ) -> Result<RegistrationWrite, StorageError> {
        self.with_session(id, |stored| {
            let status = stored.cached_status();
            if status.is_terminal() {
                return Ok(RegistrationWrite::Closed { status });
            }
            Ok(stored.add_registration(user, at))
        })
    }

    async fn unregister(&self, id: SessionId, user_id: &UserId) -> Result<bool, StorageError> {
        self.with_sessions(|sessions| {
            Ok(sessions
                .get_mut(&id)
                .is_some_and(|s| s.remove_registration(user_id)))
        })
    }

    async fn list_registrations(&self, id: SessionId) -> Result<Vec<Registration>, StorageError> {
        self.with_sessions(|sessions| {
            Ok(sessions
                .get(&id)
                .map(|s| s.registrations().to_vec())
                .unwrap_or_default())
        })
    }

    async fn join(
        &self,
        id: SessionId,
        user: &UserProfile,
        at: DateTime<Utc>,
    ) -> Result<JoinWrite, StorageError> {
        self.with_session(id, |stored| {
            let status = stored.cached_status();
            if !status.accepts_join() {
                return Ok(JoinWrite::Closed { status });
            }
            let (participant, created) = stored.join_participant(user, at);
            Ok(if created {
                JoinWrite::Joined(participant)
            } else {
                JoinWrite::AlreadyJoined(participant)
            })
        })
    }

    async fn get_participant(
        &self,
        id: SessionId,
        user_id: &UserId,
    ) -> Result<Option<Participant>, StorageError> {
        self.with_sessions(|sessions| {
            Ok(sessions
                .get(&id)
                .and_then(|s| s.participant(user_id))
                .cloned())
        })
    }

    async fn list_participants(&self, id: SessionId) -> Result<Vec<Participant>, StorageError> {
        self.with_sessions(|sessions| {
            Ok(sessions
                .get(&id)
                .map(|s| s.participants().cloned().collect())
                .unwrap_or_default())
        })
    }
}

#[async_trait]
impl AnswerRepository for InMemoryRepository {
    async fn record_answer(&self, submission: &AnswerSubmission) -> Result<AnswerWrite, StorageError> {
        self.with_session(submission.session_id, |stored| {
            let status = stored.cached_status();
            if status != SessionStatus::Active {
                return Ok(AnswerWrite::Closed { status });
            }
            let Some(participant) = stored.participant_mut(&submission.user_id) else {
                return Ok(AnswerWrite::NotJoined);
            };
            let slots = participant.answers().len();
            Ok(
                match participant.record_answer(
                    submission.question_index,
                    submission.answer_index,
                    submission.points,
                ) {
                    SlotWrite::Recorded { score } => AnswerWrite::Recorded { score },
                    SlotWrite::AlreadyAnswered { score } => AnswerWrite::AlreadyAnswered { score },
                    SlotWrite::OutOfRange => AnswerWrite::OutOfRange { slots },
                },
            )
        })
    }
}

/// Aggregates session repositories behind trait objects for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub sessions: Arc<dyn SessionRepository>,
    pub participants: Arc<dyn ParticipantRepository>,
    pub answers: Arc<dyn AnswerRepository>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        let repo = InMemoryRepository::new();
        let sessions: Arc<dyn SessionRepository> = Arc::new(repo.clone());
        let participants: Arc<dyn ParticipantRepository> = Arc::new(repo.clone());
        let answers: Arc<dyn AnswerRepository> = Arc::new(repo);
        Self {
            sessions,
            participants,
            answers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use live_core::lifecycle::LifecyclePolicy;
    use live_core::model::{Question, SessionDraft};
    use live_core::time::fixed_now;

    fn build_session(max: Option<u32>) -> LiveSession {
        LiveSession::create(
            SessionId::generate(),
            SessionDraft {
                name: "Mock exam".into(),
                description: None,
                level: "b1".into(),
                scheduled_start: fixed_now() + Duration::hours(2),
                duration_minutes: 20,
                questions: vec![Question::new("q1", 0), Question::new("q2", 1)],
                max_participants: max,
                open_enrollment: false,
                allow_immediate: false,
            },
            fixed_now(),
            &LifecyclePolicy::default(),
        )
        .unwrap()
    }

    fn student(id: &str) -> UserProfile {
        UserProfile::student(UserId::new(id).unwrap(), id, id)
    }

    #[tokio::test]
    async fn update_rejects_stale_revision() {
        let repo = InMemoryRepository::new();
        let session = build_session(None);
        repo.insert_session(&session).await.unwrap();

        let mut edit = session.clone();
        edit.apply_patch(
            live_core::model::SessionPatch {
                name: Some("Edited".into()),
                ..Default::default()
            },
            fixed_now(),
            &LifecyclePolicy::default(),
        )
        .unwrap();
        assert_eq!(repo.update_session(&edit).await.unwrap(), 1);
        assert!(matches!(
            repo.update_session(&edit).await,
            Err(StorageError::Conflict)
        ));

        let stored = repo.get_session(session.id()).await.unwrap().unwrap();
        assert_eq!(stored.name(), "Edited");
        assert_eq!(stored.revision(), 1);
    }

    #[tokio::test]
    async fn update_keeps_membership_written_since_read() {
        let repo = InMemoryRepository::new();
        let session = build_session(None);
        repo.insert_session(&session).await.unwrap();
        repo.register(session.id(), &student("a"), fixed_now())
            .await
            .unwrap();

        repo.update_session(&session).await.unwrap();
        let regs = repo.list_registrations(session.id()).await.unwrap();
        assert_eq!(regs.len(), 1);
    }

    #[tokio::test]
    async fn status_write_back_is_compare_and_set() {
        let repo = InMemoryRepository::new();
        let session = build_session(None);
        repo.insert_session(&session).await.unwrap();

        let first = repo
            .write_back_status(session.id(), SessionStatus::Scheduled, SessionStatus::Lobby)
            .await
            .unwrap();
        let second = repo
            .write_back_status(session.id(), SessionStatus::Scheduled, SessionStatus::Lobby)
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn answer_slot_is_first_write_wins() {
        let repo = InMemoryRepository::new();
        let session = build_session(None);
        repo.insert_session(&session).await.unwrap();
        repo.write_back_status(session.id(), SessionStatus::Scheduled, SessionStatus::Active)
            .await
            .unwrap();
        let user = student("a");

        let submission = |answer_index, points| AnswerSubmission {
            session_id: session.id(),
            user_id: user.user_id.clone(),
            question_index: 0,
            answer_index,
            points,
            answered_at: fixed_now(),
        };

        assert_eq!(
            repo.record_answer(&submission(0, 1)).await.unwrap(),
            AnswerWrite::NotJoined
        );
        repo.join(session.id(), &user, fixed_now()).await.unwrap();
        assert_eq!(
            repo.record_answer(&submission(0, 1)).await.unwrap(),
            AnswerWrite::Recorded { score: 1 }
        );
        assert_eq!(
            repo.record_answer(&submission(3, 0)).await.unwrap(),
            AnswerWrite::AlreadyAnswered { score: 1 }
        );
    }

    #[tokio::test]
    async fn writes_check_the_stored_status() {
        let repo = InMemoryRepository::new();
        let session = build_session(None);
        repo.insert_session(&session).await.unwrap();
        let user = student("a");

        assert_eq!(
            repo.join(session.id(), &user, fixed_now()).await.unwrap(),
            JoinWrite::Closed {
                status: SessionStatus::Scheduled
            }
        );

        repo.cancel_session(session.id()).await.unwrap();
        assert_eq!(
            repo.register(session.id(), &user, fixed_now()).await.unwrap(),
            RegistrationWrite::Closed {
                status: SessionStatus::Cancelled
            }
        );
        let answer = AnswerSubmission {
            session_id: session.id(),
            user_id: user.user_id.clone(),
            question_index: 0,
            answer_index: 0,
            points: 1,
            answered_at: fixed_now(),
        };
        assert_eq!(
            repo.record_answer(&answer).await.unwrap(),
            AnswerWrite::Closed {
                status: SessionStatus::Cancelled
            }
        );
    }

    #[tokio::test]
    async fn update_refuses_question_change_after_join() {
        let repo = InMemoryRepository::new();
        let session = build_session(None);
        repo.insert_session(&session).await.unwrap();

        let mut edit = session.clone();
        edit.apply_patch(
            live_core::model::SessionPatch {
                questions: Some(vec![Question::new("only", 0)]),
                ..Default::default()
            },
            fixed_now(),
            &LifecyclePolicy::default(),
        )
        .unwrap();

        repo.write_back_status(session.id(), SessionStatus::Scheduled, SessionStatus::Lobby)
            .await
            .unwrap();
        repo.join(session.id(), &student("a"), fixed_now()).await.unwrap();

        assert!(matches!(
            repo.update_session(&edit).await,
            Err(StorageError::Conflict)
        ));
        let stored = repo.get_session(session.id()).await.unwrap().unwrap();
        assert_eq!(stored.questions().len(), 2);
    }

    #[tokio::test]
    async fn update_refuses_cap_below_fresh_registrations() {
        let repo = InMemoryRepository::new();
        let session = build_session(None);
        repo.insert_session(&session).await.unwrap();

        let mut edit = session.clone();
        edit.apply_patch(
            live_core::model::SessionPatch {
                max_participants: Some(Some(1)),
                ..Default::default()
            },
            fixed_now(),
            &LifecyclePolicy::default(),
        )
        .unwrap();
        repo.register(session.id(), &student("a"), fixed_now()).await.unwrap();
        repo.register(session.id(), &student("b"), fixed_now()).await.unwrap();

        assert!(matches!(
            repo.update_session(&edit).await,
            Err(StorageError::Conflict)
        ));
    }

    #[tokio::test]
    async fn delete_removes_everything() {
        let repo = InMemoryRepository::new();
        let session = build_session(None);
        repo.insert_session(&session).await.unwrap();
        repo.delete_session(session.id()).await.unwrap();
        assert!(repo.get_session(session.id()).await.unwrap().is_none());
        assert!(matches!(
            repo.delete_session(session.id()).await,
            Err(StorageError::NotFound)
        ));
    }
}
