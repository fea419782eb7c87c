use serde::{Deserialize, Serialize};

use crate::model::session::SessionError;

/// Points awarded for a correct answer when the question carries no weight.
pub const DEFAULT_POINTS: u32 = 1;

/// Reference to a question from the external question bank.
///
/// Content lives elsewhere; a session only needs the reference, the index of
/// the correct choice, and an optional difficulty weight for scoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub reference: String,
    pub correct_answer: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

impl Question {
    #[must_use]
    pub fn new(reference: impl Into<String>, correct_answer: u32) -> Self {
        Self {
            reference: reference.into(),
            correct_answer,
            weight: None,
        }
    }

    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Points a correct answer to this question is worth.
    #[must_use]
    pub fn points(&self) -> u32 {
        self.weight.unwrap_or(DEFAULT_POINTS)
    }

    #[must_use]
    pub fn is_correct(&self, answer_index: u32) -> bool {
        self.correct_answer == answer_index
    }

    /// Points earned by submitting `answer_index`.
    #[must_use]
    pub fn score_for(&self, answer_index: u32) -> u32 {
        if self.is_correct(answer_index) {
            self.points()
        } else {
            0
        }
    }

    pub(crate) fn validate(&self, index: usize) -> Result<(), SessionError> {
        if self.reference.trim().is_empty() {
            return Err(SessionError::EmptyQuestionReference { index });
        }
        if self.weight == Some(0) {
            return Err(SessionError::InvalidQuestionWeight { index });
        }
        Ok(())
    }
}

pub(crate) fn validate_questions(questions: &[Question]) -> Result<(), SessionError> {
    if questions.is_empty() {
        return Err(SessionError::NoQuestions);
    }
    questions
        .iter()
        .enumerate()
        .try_for_each(|(index, q)| q.validate(index))
}

/// Which question slots a regenerate operation replaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum QuestionSelection {
    /// Replace the whole set; the new set may differ in length.
    All,
    /// Replace the listed slots, pairing each with a replacement in order.
    Indices { indices: Vec<usize> },
    /// Replace the half-open slot range `start..end`.
    Range { start: usize, end: usize },
}

impl QuestionSelection {
    /// Applies the selection to `current`, producing the new question set.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidSelection` when indices are out of range,
    /// duplicated, or the replacement count does not match the selection.
    pub fn apply(
        &self,
        current: &[Question],
        replacements: Vec<Question>,
    ) -> Result<Vec<Question>, SessionError> {
        let next = match self {
            QuestionSelection::All => replacements,
            QuestionSelection::Indices { indices } => {
                if indices.is_empty() {
                    return Err(SessionError::InvalidSelection("no indices selected".into()));
                }
                if indices.len() != replacements.len() {
                    return Err(SessionError::InvalidSelection(format!(
                        "{} indices but {} replacement questions",
                        indices.len(),
                        replacements.len()
                    )));
                }
                let mut seen = vec![false; current.len()];
                for &index in indices {
                    let Some(slot) = seen.get_mut(index) else {
                        return Err(SessionError::QuestionIndexOutOfRange {
                            index,
                            len: current.len(),
                        });
                    };
                    if *slot {
                        return Err(SessionError::InvalidSelection(format!(
                            "index {index} selected twice"
                        )));
                    }
                    *slot = true;
                }
                let mut next = current.to_vec();
                for (&index, question) in indices.iter().zip(replacements) {
                    next[index] = question;
                }
                next
            }
            QuestionSelection::Range { start, end } => {
                if start >= end || *end > current.len() {
                    return Err(SessionError::InvalidSelection(format!(
                        "range {start}..{end} is not within 0..{}",
                        current.len()
                    )));
                }
                if end - start != replacements.len() {
                    return Err(SessionError::InvalidSelection(format!(
                        "range covers {} slots but {} replacement questions",
                        end - start,
                        replacements.len()
                    )));
                }
                let mut next = current.to_vec();
                next.splice(start..end, replacements);
                next
            }
        };
        validate_questions(&next)?;
        Ok(next)
    }
}
