//! Leaderboards and per-question statistics. Available in every status so
//! completed and cancelled sessions stay queryable.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use live_core::Clock;
use live_core::lifecycle::LifecyclePolicy;
use live_core::model::{Participant, Question, SessionId, SessionStatus, UserId};
use storage::repository::{ParticipantRepository, SessionRepository};

use crate::error::LiveSessionError;
use crate::gate::StatusGate;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    /// Competition rank: tied scores share a rank and the next rank is skipped.
    pub rank: usize,
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
    pub score: u32,
    pub answered: usize,
    pub correct: usize,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionStats {
    pub index: usize,
    pub answered: usize,
    pub correct: usize,
    /// Share of participants answering correctly; `0.0` with no participants.
    pub correct_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatistics {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub registered: usize,
    pub participants: usize,
    pub average_score: f64,
    pub questions: Vec<QuestionStats>,
}

#[derive(Clone)]
pub struct ResultsService {
    gate: StatusGate,
    participants: Arc<dyn ParticipantRepository>,
}

impl ResultsService {
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

    /// Participants ordered by score, ties broken by who joined first.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the id is unknown.
    pub async fn leaderboard(
        &self,
        id: SessionId,
    ) -> Result<Vec<LeaderboardEntry>, LiveSessionError> {
        let session = self.gate.load(id).await?;
        let participants = self.load_participants(id).await?;
        Ok(rank(participants, session.questions()))
    }

    /// # Errors
    ///
    /// Returns `SessionNotFound` if the id is unknown.
    #[allow(clippy::cast_precision_loss)]
    pub async fn statistics(&self, id: SessionId) -> Result<SessionStatistics, LiveSessionError> {
        let session = self.gate.load(id).await?;
        let participants = self.load_participants(id).await?;
        let questions = session.questions();

        let total_score: u64 = participants.iter().map(|p| u64::from(p.score())).sum();
        let questions = questions
            .iter()
            .enumerate()
            .map(|(index, question)| {
                let slots = participants.iter().filter_map(|p| p.answers().get(index).copied().flatten());
                let (answered, correct) = slots.fold((0, 0), |(answered, correct), answer| {
                    (answered + 1, correct + usize::from(question.is_correct(answer)))
                });
                QuestionStats {
                    index,
                    answered,
                    correct,
                    correct_rate: ratio(correct as f64, participants.len()),
                }
            })
            .collect();

        Ok(SessionStatistics {
            session_id: id,
            status: session.cached_status(),
            registered: session.registrations().len(),
            participants: participants.len(),
            average_score: ratio(total_score as f64, participants.len()),
            questions,
        })
    }

    async fn load_participants(&self, id: SessionId) -> Result<Vec<Participant>, LiveSessionError> {
        self.participants
            .list_participants(id)
            .await
            .map_err(|err| LiveSessionError::from_storage(err, id))
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: f64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        numerator / count as f64
    }
}

fn rank(mut participants: Vec<Participant>, questions: &[Question]) -> Vec<LeaderboardEntry> {
    participants.sort_by(|a, b| {
        b.score()
            .cmp(&a.score())
            .then(a.joined_at().cmp(&b.joined_at()))
            .then_with(|| a.user_id().cmp(b.user_id()))
    });

    let mut entries: Vec<LeaderboardEntry> = Vec::with_capacity(participants.len());
    for (position, p) in participants.iter().enumerate() {
        let rank = match entries.last() {
            Some(prev) if prev.score == p.score() => prev.rank,
            _ => position + 1,
        };
        entries.push(LeaderboardEntry {
            rank,
            user_id: p.user_id().clone(),
            username: p.username().to_owned(),
            display_name: p.display_name().to_owned(),
            score: p.score(),
            answered: p.answered_count(),
            correct: p.correct_count(questions),
            joined_at: p.joined_at(),
        });
    }
    entries
}
