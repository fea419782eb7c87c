use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use live_core::Clock;
use live_core::lifecycle::LifecyclePolicy;
use live_core::model::{SessionError, SessionId, SessionStatus, UserId};
use storage::repository::{AnswerRepository, AnswerSubmission, AnswerWrite, SessionRepository};

use crate::error::{LiveSessionError, Operation};
use crate::gate::StatusGate;

/// Immediate feedback for an accepted answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AnswerReceipt {
    /// Cumulative score after this answer.
    pub score: u32,
    pub correct: bool,
    pub points_awarded: u32,
}

/// Records one answer per question per participant.
#[derive(Clone)]
pub struct AnswerSubmissionService {
    gate: StatusGate,
    answers: Arc<dyn AnswerRepository>,
}

impl AnswerSubmissionService {
    #[must_use]
    pub fn new(
        clock: Clock,
        policy: LifecyclePolicy,
        sessions: Arc<dyn SessionRepository>,
        answers: Arc<dyn AnswerRepository>,
    ) -> Self {
        Self {
            gate: StatusGate::new(clock, policy, sessions),
            answers,
        }
    }

    /// Records `answer_index` for `question_index`; the first write wins.
    ///
    /// Points are computed here, once, and added to the stored score in the
    /// same atomic write that fills the slot.
    ///
    /// # Errors
    ///
    /// Each rejection is distinct: `InvalidTransition` when the session is
    /// not `Active`, `Validation(QuestionIndexOutOfRange)` for a bad index,
    /// `ParticipantNotFound` before joining, and `AlreadyAnswered` (carrying
    /// the unchanged score) for a filled slot.
    pub async fn submit_answer(
        &self,
        id: SessionId,
        user_id: &UserId,
        question_index: usize,
        answer_index: u32,
    ) -> Result<AnswerReceipt, LiveSessionError> {
        let session = self.gate.load(id).await?;
        let status = session.cached_status();
        if status != SessionStatus::Active {
            return Err(LiveSessionError::InvalidTransition {
                operation: Operation::SubmitAnswer,
                status,
            });
        }
        let question = session.questions().get(question_index).ok_or_else(|| {
            LiveSessionError::Validation(SessionError::QuestionIndexOutOfRange {
                index: question_index,
                len: session.questions().len(),
            })
        })?;
        let not_joined = || LiveSessionError::ParticipantNotFound {
            session_id: id,
            user_id: user_id.clone(),
        };
        if session.participant(user_id).is_none() {
            return Err(not_joined());
        }

        let points = question.score_for(answer_index);
        let submission = AnswerSubmission {
            session_id: id,
            user_id: user_id.clone(),
            question_index,
            answer_index,
            points,
            answered_at: self.gate.clock().now(),
        };
        let write = self
            .answers
            .record_answer(&submission)
            .await
            .map_err(|err| LiveSessionError::from_storage(err, id))?;

        match write {
            AnswerWrite::Recorded { score } => {
                info!(session_id = %id, %user_id, question_index, points, score, "answer recorded");
                Ok(AnswerReceipt {
                    score,
                    correct: question.is_correct(answer_index),
                    points_awarded: points,
                })
            }
            AnswerWrite::AlreadyAnswered { score } => {
                debug!(session_id = %id, %user_id, question_index, "duplicate answer ignored");
                Err(LiveSessionError::AlreadyAnswered {
                    question_index,
                    score,
                })
            }
            AnswerWrite::OutOfRange { slots } => Err(LiveSessionError::Validation(
                SessionError::QuestionIndexOutOfRange {
                    index: question_index,
                    len: slots,
                },
            )),
            AnswerWrite::NotJoined => Err(not_joined()),
            AnswerWrite::Closed { status } => {
                debug!(session_id = %id, %user_id, %status, "answer refused by stored status");
                Err(LiveSessionError::InvalidTransition {
                    operation: Operation::SubmitAnswer,
                    status,
                })
            }
        }
    }
}
