use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::lifecycle::{self, LifecyclePolicy, StatusTransition};
use crate::model::ids::{SessionId, UserId};
use crate::model::participant::{Participant, Registration, UserProfile};
use crate::model::question::{Question, QuestionSelection, validate_questions};
use crate::model::status::SessionStatus;

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionError {
    #[error("session name cannot be empty")]
    EmptyName,

    #[error("duration must be > 0 minutes")]
    NonPositiveDuration,

    #[error("a session needs at least one question")]
    NoQuestions,

    #[error("question {index} has an empty reference")]
    EmptyQuestionReference { index: usize },

    #[error("question {index} has a zero weight")]
    InvalidQuestionWeight { index: usize },

    #[error("participant cap must be > 0")]
    InvalidCapacity,

    #[error("participant cap {requested} is below the {registered} users already registered")]
    CapacityBelowRegistrations { registered: usize, requested: u32 },

    #[error("question index {index} is out of range for {len} questions")]
    QuestionIndexOutOfRange { index: usize, len: usize },

    #[error("invalid question selection: {0}")]
    InvalidSelection(String),

    #[error("start time leaves no scheduled window; lobby would open at {lobby_opens_at}")]
    StartTooSoon { lobby_opens_at: DateTime<Utc> },

    #[error("lobby lead cannot be negative")]
    InvalidLobbyLead,

    #[error("{field} cannot change while the session is {status}")]
    FieldLocked {
        field: &'static str,
        status: SessionStatus,
    },
}

//
// ─── DRAFT & PATCH ─────────────────────────────────────────────────────────────
//

/// Administrator input for a new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub level: String,
    pub scheduled_start: DateTime<Utc>,
    pub duration_minutes: u32,
    pub questions: Vec<Question>,
    #[serde(default)]
    pub max_participants: Option<u32>,
    #[serde(default)]
    pub open_enrollment: bool,
    /// Accept a start time whose lobby is already open.
    #[serde(default)]
    pub allow_immediate: bool,
}

/// Partial update of an existing session. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub level: Option<String>,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub duration_minutes: Option<u32>,
    pub max_participants: Option<Option<u32>>,
    pub open_enrollment: Option<bool>,
    pub questions: Option<Vec<Question>>,
    #[serde(default)]
    pub allow_immediate: bool,
}

impl SessionPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.level.is_none()
            && self.scheduled_start.is_none()
            && self.duration_minutes.is_none()
            && self.max_participants.is_none()
            && self.open_enrollment.is_none()
            && self.questions.is_none()
    }
}

/// Outcome of adding a user to the interest list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationWrite {
    Registered,
    AlreadyRegistered,
    CapacityExceeded { max: u32 },
    /// The stored session already completed or was cancelled.
    Closed { status: SessionStatus },
}

/// Every stored attribute of a session, used to rehydrate from storage.
#[derive(Debug, Clone)]
pub struct PersistedSession {
    pub id: SessionId,
    pub name: String,
    pub description: Option<String>,
    pub level: String,
    pub scheduled_start: DateTime<Utc>,
    pub duration_minutes: u32,
    pub questions: Vec<Question>,
    pub max_participants: Option<u32>,
    pub open_enrollment: bool,
    pub cancelled: bool,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub revision: u64,
    pub registrations: Vec<Registration>,
    pub participants: Vec<Participant>,
}

//
// ─── SESSION ───────────────────────────────────────────────────────────────────
//

/// A scheduled, time-boxed live practice event with a fixed question set.
///
/// `status` is a cache of `lifecycle::resolve_status`; callers must refresh it
/// with `refresh_status` before trusting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSession {
    id: SessionId,
    name: String,
    description: Option<String>,
    level: String,
    scheduled_start: DateTime<Utc>,
    duration_minutes: u32,
    questions: Vec<Question>,
    max_participants: Option<u32>,
    open_enrollment: bool,
    cancelled: bool,
    status: SessionStatus,
    created_at: DateTime<Utc>,
    revision: u64,
    registrations: Vec<Registration>,
    participants: BTreeMap<UserId, Participant>,
}

fn validate_name(name: &str) -> Result<(), SessionError> {
    if name.trim().is_empty() {
        return Err(SessionError::EmptyName);
    }
    Ok(())
}

fn validate_duration(duration_minutes: u32) -> Result<(), SessionError> {
    if duration_minutes == 0 {
        return Err(SessionError::NonPositiveDuration);
    }
    Ok(())
}

fn validate_capacity(max_participants: Option<u32>) -> Result<(), SessionError> {
    if max_participants == Some(0) {
        return Err(SessionError::InvalidCapacity);
    }
    Ok(())
}

fn normalize_description(description: Option<String>) -> Option<String> {
    description
        .map(|d| d.trim().to_owned())
        .filter(|d| !d.is_empty())
}

impl LiveSession {
    /// Create a new session in the `Scheduled` state.
    ///
    /// # Errors
    ///
    /// Returns `SessionError` if any field fails validation, or
    /// `SessionError::StartTooSoon` if the start leaves no scheduled window and
    /// the draft does not opt into an immediate start.
    pub fn create(
        id: SessionId,
        draft: SessionDraft,
        now: DateTime<Utc>,
        policy: &LifecyclePolicy,
    ) -> Result<Self, SessionError> {
        validate_name(&draft.name)?;
        validate_duration(draft.duration_minutes)?;
        validate_questions(&draft.questions)?;
        validate_capacity(draft.max_participants)?;
        lifecycle::validate_schedule(draft.scheduled_start, now, policy, draft.allow_immediate)?;

        Ok(Self {
            id,
            name: draft.name.trim().to_owned(),
            description: normalize_description(draft.description),
            level: draft.level.trim().to_owned(),
            scheduled_start: draft.scheduled_start,
            duration_minutes: draft.duration_minutes,
            questions: draft.questions,
            max_participants: draft.max_participants,
            open_enrollment: draft.open_enrollment,
            cancelled: false,
            status: SessionStatus::Scheduled,
            created_at: now,
            revision: 0,
            registrations: Vec::new(),
            participants: BTreeMap::new(),
        })
    }

    /// Rehydrate a session from persisted storage.
    ///
    /// # Errors
    ///
    /// Returns `SessionError` if the stored record violates model invariants.
    pub fn from_persisted(parts: PersistedSession) -> Result<Self, SessionError> {
        validate_name(&parts.name)?;
        validate_duration(parts.duration_minutes)?;
        validate_questions(&parts.questions)?;
        validate_capacity(parts.max_participants)?;

        let slots = parts.questions.len();
        let mut participants = BTreeMap::new();
        for participant in parts.participants {
            if participant.answers().len() != slots {
                return Err(SessionError::QuestionIndexOutOfRange {
                    index: participant.answers().len(),
                    len: slots,
                });
            }
            participants.insert(participant.user_id().clone(), participant);
        }

        Ok(Self {
            id: parts.id,
            name: parts.name,
            description: parts.description,
            level: parts.level,
            scheduled_start: parts.scheduled_start,
            duration_minutes: parts.duration_minutes,
            questions: parts.questions,
            max_participants: parts.max_participants,
            open_enrollment: parts.open_enrollment,
            cancelled: parts.cancelled,
            status: parts.status,
            created_at: parts.created_at,
            revision: parts.revision,
            registrations: parts.registrations,
            participants,
        })
    }

    // Accessors
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    #[must_use]
    pub fn level(&self) -> &str {
        &self.level
    }

    #[must_use]
    pub fn scheduled_start(&self) -> DateTime<Utc> {
        self.scheduled_start
    }

    #[must_use]
    pub fn duration_minutes(&self) -> u32 {
        self.duration_minutes
    }

    #[must_use]
    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    #[must_use]
    pub fn max_participants(&self) -> Option<u32> {
        self.max_participants
    }

    #[must_use]
    pub fn open_enrollment(&self) -> bool {
        self.open_enrollment
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Last persisted status. May be stale; see `status_at`.
    #[must_use]
    pub fn cached_status(&self) -> SessionStatus {
        self.status
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Optimistic-concurrency token, bumped by storage on every update.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    #[must_use]
    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    #[must_use]
    pub fn participant(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants.get(user_id)
    }

    #[must_use]
    pub fn is_registered(&self, user_id: &UserId) -> bool {
        self.registrations.iter().any(|r| &r.user_id == user_id)
    }

    #[must_use]
    pub fn lobby_opens_at(&self, policy: &LifecyclePolicy) -> DateTime<Utc> {
        policy.lobby_opens_at(self.scheduled_start)
    }

    #[must_use]
    pub fn ends_at(&self) -> DateTime<Utc> {
        lifecycle::ends_at(self.scheduled_start, self.duration_minutes)
    }

    /// Status computed from the schedule and the cancellation flag at `now`.
    #[must_use]
    pub fn status_at(&self, now: DateTime<Utc>, policy: &LifecyclePolicy) -> SessionStatus {
        lifecycle::resolve_status(
            self.scheduled_start,
            self.duration_minutes,
            self.cancelled,
            now,
            policy,
        )
    }

    /// Status at `now`, never behind the cached status another caller
    /// already wrote back.
    #[must_use]
    pub fn effective_status(&self, now: DateTime<Utc>, policy: &LifecyclePolicy) -> SessionStatus {
        lifecycle::plan_transition(self.status, self.status_at(now, policy))
            .map_or(self.status, |t| t.to)
    }

    /// Status that decides which fields an edit may touch. Participants only
    /// exist once the lobby has opened, so their presence rules out `Scheduled`.
    fn edit_status(&self, now: DateTime<Utc>, policy: &LifecyclePolicy) -> SessionStatus {
        match self.effective_status(now, policy) {
            SessionStatus::Scheduled if !self.participants.is_empty() => SessionStatus::Lobby,
            status => status,
        }
    }

    /// Brings the cached status up to date, returning the transition applied.
    pub fn refresh_status(
        &mut self,
        now: DateTime<Utc>,
        policy: &LifecyclePolicy,
    ) -> Option<StatusTransition> {
        let transition = lifecycle::plan_transition(self.status, self.status_at(now, policy))?;
        self.status = transition.to;
        Some(transition)
    }

    /// Copies the administrator-editable definition from `edited`, keeping
    /// this session's identity, lifecycle flags, and membership.
    pub fn copy_definition_from(&mut self, edited: &LiveSession) {
        self.name.clone_from(&edited.name);
        self.description.clone_from(&edited.description);
        self.level.clone_from(&edited.level);
        self.scheduled_start = edited.scheduled_start;
        self.duration_minutes = edited.duration_minutes;
        self.questions.clone_from(&edited.questions);
        self.max_participants = edited.max_participants;
        self.open_enrollment = edited.open_enrollment;
    }

    pub fn set_cached_status(&mut self, status: SessionStatus) {
        self.status = status;
    }

    pub fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    /// Sets the terminal cancellation flag.
    ///
    /// Returns `false` if the session was already cancelled.
    pub fn cancel(&mut self) -> bool {
        if self.cancelled {
            return false;
        }
        self.cancelled = true;
        self.status = SessionStatus::Cancelled;
        true
    }

    /// Applies an administrator edit, enforcing which fields the current
    /// status still allows to change.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::FieldLocked` for edits the status forbids and
    /// other `SessionError` variants for invalid values. The session is left
    /// unchanged on error.
    pub fn apply_patch(
        &mut self,
        patch: SessionPatch,
        now: DateTime<Utc>,
        policy: &LifecyclePolicy,
    ) -> Result<(), SessionError> {
        let status = self.edit_status(now, policy);
        let locked = |field: &'static str| SessionError::FieldLocked { field, status };
        if status == SessionStatus::Cancelled && !patch.is_empty() {
            return Err(locked("session"));
        }

        let mut next = self.clone();
        if let Some(name) = patch.name {
            validate_name(&name)?;
            next.name = name.trim().to_owned();
        }
        if let Some(description) = patch.description {
            next.description = normalize_description(description);
        }
        if let Some(level) = patch.level {
            next.level = level.trim().to_owned();
        }
        if let Some(start) = patch.scheduled_start {
            if status != SessionStatus::Scheduled {
                return Err(locked("scheduled_start"));
            }
            lifecycle::validate_schedule(start, now, policy, patch.allow_immediate)?;
            next.scheduled_start = start;
        }
        if let Some(duration) = patch.duration_minutes {
            if !status.accepts_registration() {
                return Err(locked("duration_minutes"));
            }
            validate_duration(duration)?;
            next.duration_minutes = duration;
        }
        if let Some(max) = patch.max_participants {
            if !status.accepts_registration() {
                return Err(locked("max_participants"));
            }
            validate_capacity(max)?;
            if let Some(requested) = max {
                let registered = next.registrations.len();
                if usize::try_from(requested).unwrap_or(usize::MAX) < registered {
                    return Err(SessionError::CapacityBelowRegistrations {
                        registered,
                        requested,
                    });
                }
            }
            next.max_participants = max;
        }
        if let Some(open) = patch.open_enrollment {
            if !status.accepts_registration() {
                return Err(locked("open_enrollment"));
            }
            next.open_enrollment = open;
        }
        if let Some(questions) = patch.questions {
            if status != SessionStatus::Scheduled {
                return Err(locked("questions"));
            }
            validate_questions(&questions)?;
            next.questions = questions;
        }

        *self = next;
        Ok(())
    }

    /// Replaces the selected questions. Only allowed while `Scheduled` and
    /// before anyone has joined.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::FieldLocked` once the lobby has opened, or a
    /// selection error from `QuestionSelection::apply`.
    pub fn regenerate_questions(
        &mut self,
        selection: &QuestionSelection,
        replacements: Vec<Question>,
        now: DateTime<Utc>,
        policy: &LifecyclePolicy,
    ) -> Result<(), SessionError> {
        let status = self.edit_status(now, policy);
        if status != SessionStatus::Scheduled {
            return Err(SessionError::FieldLocked {
                field: "questions",
                status,
            });
        }
        self.questions = selection.apply(&self.questions, replacements)?;
        Ok(())
    }

    /// Adds `user` to the interest list, honouring the participant cap.
    pub fn add_registration(&mut self, user: &UserProfile, at: DateTime<Utc>) -> RegistrationWrite {
        if self.is_registered(&user.user_id) {
            return RegistrationWrite::AlreadyRegistered;
        }
        if let Some(max) = self.max_participants {
            if self.registrations.len() >= usize::try_from(max).unwrap_or(usize::MAX) {
                return RegistrationWrite::CapacityExceeded { max };
            }
        }
        self.registrations.push(Registration::new(user, at));
        RegistrationWrite::Registered
    }

    /// Removes `user_id` from the interest list. Returns whether it was present.
    pub fn remove_registration(&mut self, user_id: &UserId) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| &r.user_id != user_id);
        self.registrations.len() != before
    }

    /// Joins `user`, or returns the existing participant untouched.
    ///
    /// The boolean is `true` when a new participant was created.
    pub fn join_participant(&mut self, user: &UserProfile, at: DateTime<Utc>) -> (Participant, bool) {
        if let Some(existing) = self.participants.get(&user.user_id) {
            return (existing.clone(), false);
        }
        let participant = Participant::join(user, self.questions.len(), at);
        self.participants
            .insert(user.user_id.clone(), participant.clone());
        (participant, true)
    }

    pub fn participant_mut(&mut self, user_id: &UserId) -> Option<&mut Participant> {
        self.participants.get_mut(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;
    use chrono::Duration;

    fn draft() -> SessionDraft {
        SessionDraft {
            name: "Algebra sprint".into(),
            description: Some("  ".into()),
            level: "grade-8".into(),
            scheduled_start: fixed_now() + Duration::hours(1),
            duration_minutes: 30,
            questions: vec![Question::new("q1", 1), Question::new("q2", 2)],
            max_participants: Some(2),
            open_enrollment: false,
            allow_immediate: false,
        }
    }

    fn session() -> LiveSession {
        LiveSession::create(SessionId::generate(), draft(), fixed_now(), &LifecyclePolicy::default())
            .unwrap()
    }

    fn user(id: &str) -> UserProfile {
        UserProfile::student(UserId::new(id).unwrap(), id, id.to_uppercase())
    }

    #[test]
    fn create_starts_scheduled_and_normalizes() {
        let s = session();
        assert_eq!(s.cached_status(), SessionStatus::Scheduled);
        assert_eq!(s.description(), None);
        assert_eq!(s.revision(), 0);
        assert_eq!(s.ends_at(), s.scheduled_start() + Duration::minutes(30));
    }

    #[test]
    fn create_rejects_invalid_fields() {
        let policy = LifecyclePolicy::default();
        let mut d = draft();
        d.duration_minutes = 0;
        assert_eq!(
            LiveSession::create(SessionId::generate(), d, fixed_now(), &policy).unwrap_err(),
            SessionError::NonPositiveDuration
        );

        let mut d = draft();
        d.questions.clear();
        assert_eq!(
            LiveSession::create(SessionId::generate(), d, fixed_now(), &policy).unwrap_err(),
            SessionError::NoQuestions
        );

        let mut d = draft();
        d.scheduled_start = fixed_now() + Duration::minutes(3);
        assert!(matches!(
            LiveSession::create(SessionId::generate(), d, fixed_now(), &policy),
            Err(SessionError::StartTooSoon { .. })
        ));
    }

    #[test]
    fn refresh_writes_forward_transitions_only() {
        let policy = LifecyclePolicy::default();
        let mut s = session();
        let active_at = s.scheduled_start() + Duration::minutes(1);
        let t = s.refresh_status(active_at, &policy).unwrap();
        assert_eq!((t.from, t.to), (SessionStatus::Scheduled, SessionStatus::Active));
        assert_eq!(s.refresh_status(active_at, &policy), None);
        assert_eq!(s.refresh_status(fixed_now(), &policy), None);
        assert_eq!(s.cached_status(), SessionStatus::Active);
    }

    #[test]
    fn registration_is_idempotent_and_capped() {
        let mut s = session();
        let at = fixed_now();
        assert_eq!(s.add_registration(&user("a"), at), RegistrationWrite::Registered);
        assert_eq!(s.add_registration(&user("a"), at), RegistrationWrite::AlreadyRegistered);
        assert_eq!(s.registrations().len(), 1);
        assert_eq!(s.add_registration(&user("b"), at), RegistrationWrite::Registered);
        assert_eq!(
            s.add_registration(&user("c"), at),
            RegistrationWrite::CapacityExceeded { max: 2 }
        );
        assert!(s.remove_registration(&user("a").user_id));
        assert!(!s.remove_registration(&user("a").user_id));
    }

    #[test]
    fn join_returns_existing_participant_unchanged() {
        let mut s = session();
        let (first, created) = s.join_participant(&user("a"), fixed_now());
        assert!(created);
        s.participant_mut(first.user_id()).unwrap().record_answer(0, 1, 1);

        let (again, created) = s.join_participant(&user("a"), fixed_now() + Duration::minutes(9));
        assert!(!created);
        assert_eq!(again.joined_at(), fixed_now());
        assert_eq!(again.answers(), &[Some(1), None]);
    }

    #[test]
    fn patch_locks_fields_by_status() {
        let policy = LifecyclePolicy::default();
        let mut s = session();
        let lobby = s.scheduled_start() - Duration::minutes(2);
        let active = s.scheduled_start() + Duration::minutes(2);

        let err = s
            .apply_patch(
                SessionPatch {
                    questions: Some(vec![Question::new("x", 0)]),
                    ..SessionPatch::default()
                },
                lobby,
                &policy,
            )
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::FieldLocked {
                field: "questions",
                status: SessionStatus::Lobby
            }
        );

        s.apply_patch(
            SessionPatch {
                duration_minutes: Some(45),
                ..SessionPatch::default()
            },
            lobby,
            &policy,
        )
        .unwrap();
        assert_eq!(s.duration_minutes(), 45);

        let err = s
            .apply_patch(
                SessionPatch {
                    duration_minutes: Some(10),
                    ..SessionPatch::default()
                },
                active,
                &policy,
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::FieldLocked { field: "duration_minutes", .. }));

        s.apply_patch(
            SessionPatch {
                name: Some("Renamed".into()),
                ..SessionPatch::default()
            },
            active,
            &policy,
        )
        .unwrap();
        assert_eq!(s.name(), "Renamed");
    }

    #[test]
    fn failed_patch_leaves_session_untouched() {
        let policy = LifecyclePolicy::default();
        let mut s = session();
        let before = s.clone();
        let err = s.apply_patch(
            SessionPatch {
                name: Some("New".into()),
                duration_minutes: Some(0),
                ..SessionPatch::default()
            },
            fixed_now(),
            &policy,
        );
        assert_eq!(err.unwrap_err(), SessionError::NonPositiveDuration);
        assert_eq!(s, before);
    }

    #[test]
    fn cancelled_session_rejects_edits() {
        let policy = LifecyclePolicy::default();
        let mut s = session();
        assert!(s.cancel());
        assert!(!s.cancel());
        let err = s
            .apply_patch(
                SessionPatch {
                    name: Some("x".into()),
                    ..SessionPatch::default()
                },
                fixed_now(),
                &policy,
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::FieldLocked { status: SessionStatus::Cancelled, .. }));
    }

    #[test]
    fn capacity_cannot_drop_below_registrations() {
        let policy = LifecyclePolicy::default();
        let mut s = session();
        s.add_registration(&user("a"), fixed_now());
        s.add_registration(&user("b"), fixed_now());
        let err = s
            .apply_patch(
                SessionPatch {
                    max_participants: Some(Some(1)),
                    ..SessionPatch::default()
                },
                fixed_now(),
                &policy,
            )
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::CapacityBelowRegistrations {
                registered: 2,
                requested: 1
            }
        );
    }

    #[test]
    fn edits_respect_status_written_back_by_a_faster_clock() {
        let policy = LifecyclePolicy::default();
        let mut s = session();
        let lobby = s.scheduled_start() - Duration::minutes(2);
        s.refresh_status(lobby, &policy).unwrap();

        let lagging = s.scheduled_start() - Duration::minutes(20);
        assert_eq!(s.status_at(lagging, &policy), SessionStatus::Scheduled);
        assert_eq!(s.effective_status(lagging, &policy), SessionStatus::Lobby);

        let err = s
            .regenerate_questions(&QuestionSelection::All, vec![Question::new("z", 0)], lagging, &policy)
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::FieldLocked {
                field: "questions",
                status: SessionStatus::Lobby
            }
        );
        let err = s
            .apply_patch(
                SessionPatch {
                    scheduled_start: Some(lagging + Duration::hours(3)),
                    ..SessionPatch::default()
                },
                lagging,
                &policy,
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::FieldLocked { field: "scheduled_start", .. }));
    }

    #[test]
    fn joined_participants_lock_questions() {
        let policy = LifecyclePolicy::default();
        let mut s = session();
        s.join_participant(&user("a"), fixed_now());
        assert_eq!(s.cached_status(), SessionStatus::Scheduled);

        let err = s
            .apply_patch(
                SessionPatch {
                    questions: Some(vec![Question::new("x", 0)]),
                    ..SessionPatch::default()
                },
                fixed_now(),
                &policy,
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::FieldLocked { field: "questions", .. }));
        assert_eq!(s.questions().len(), 2);
    }

    #[test]
    fn regenerate_is_scheduled_only() {
        let policy = LifecyclePolicy::default();
        let mut s = session();
        s.regenerate_questions(
            &QuestionSelection::Indices { indices: vec![1] },
            vec![Question::new("fresh", 3)],
            fixed_now(),
            &policy,
        )
        .unwrap();
        assert_eq!(s.questions()[1].reference, "fresh");

        let lobby = s.scheduled_start() - Duration::minutes(1);
        let err = s
            .regenerate_questions(&QuestionSelection::All, vec![Question::new("z", 0)], lobby, &policy)
            .unwrap_err();
        assert!(matches!(err, SessionError::FieldLocked { .. }));
    }
}
