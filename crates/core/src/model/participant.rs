use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ids::UserId;
use crate::model::question::Question;

/// Role granted by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Student,
}

/// Identity attributes of a caller, as vouched for by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
    pub role: Role,
}

impl UserProfile {
    #[must_use]
    pub fn student(user_id: UserId, username: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
            display_name: display_name.into(),
            role: Role::Student,
        }
    }

    #[must_use]
    pub fn admin(user_id: UserId, username: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
            display_name: display_name.into(),
            role: Role::Admin,
        }
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Interest-list entry created by registering for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
    pub registered_at: DateTime<Utc>,
}

impl Registration {
    #[must_use]
    pub fn new(user: &UserProfile, registered_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user.user_id.clone(),
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            registered_at,
        }
    }
}

/// A user who has joined a session and owns one answer slot per question.
///
/// Slots are write-once: `record_answer` refuses to touch a filled slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    user_id: UserId,
    username: String,
    display_name: String,
    answers: Vec<Option<u32>>,
    score: u32,
    joined_at: DateTime<Utc>,
}

/// Result of writing into a participant's answer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotWrite {
    Recorded { score: u32 },
    AlreadyAnswered { score: u32 },
    OutOfRange,
}

impl Participant {
    /// Creates a freshly joined participant with `slots` empty answers.
    #[must_use]
    pub fn join(user: &UserProfile, slots: usize, joined_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user.user_id.clone(),
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            answers: vec![None; slots],
            score: 0,
            joined_at,
        }
    }

    /// Rehydrate a participant from persisted storage.
    #[must_use]
    pub fn from_persisted(
        user_id: UserId,
        username: String,
        display_name: String,
        answers: Vec<Option<u32>>,
        score: u32,
        joined_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            username,
            display_name,
            answers,
            score,
            joined_at,
        }
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    #[must_use]
    pub fn answers(&self) -> &[Option<u32>] {
        &self.answers
    }

    #[must_use]
    pub fn score(&self) -> u32 {
        self.score
    }

    #[must_use]
    pub fn joined_at(&self) -> DateTime<Utc> {
        self.joined_at
    }

    #[must_use]
    pub fn answered_count(&self) -> usize {
        self.answers.iter().filter(|slot| slot.is_some()).count()
    }

    /// First-write-wins update of one slot, adding `points` on success.
    ///
    /// The score increment is computed by the caller at write time; it is
    /// never derived again from the full answer history.
    pub fn record_answer(&mut self, question_index: usize, answer_index: u32, points: u32) -> SlotWrite {
        let Some(slot) = self.answers.get_mut(question_index) else {
            return SlotWrite::OutOfRange;
        };
        if slot.is_some() {
            return SlotWrite::AlreadyAnswered { score: self.score };
        }
        *slot = Some(answer_index);
        self.score = self.score.saturating_add(points);
        SlotWrite::Recorded { score: self.score }
    }

    /// Number of slots matching the correct answer of the question at the same index.
    #[must_use]
    pub fn correct_count(&self, questions: &[Question]) -> usize {
        self.answers
            .iter()
            .zip(questions)
            .filter(|(slot, q)| slot.is_some_and(|a| q.is_correct(a)))
            .count()
    }

    /// Score derived from scratch; used to audit the incremental score.
    #[must_use]
    pub fn recompute_score(&self, questions: &[Question]) -> u32 {
        self.answers
            .iter()
            .zip(questions)
            .filter_map(|(slot, q)| slot.map(|a| q.score_for(a)))
            .fold(0_u32, u32::saturating_add)
    }
}
