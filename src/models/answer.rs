// src/models/answer.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// A candidate's answer to one question.
///
/// The wire format is shape-agnostic JSON (`{"selected": "B"}`,
/// `{"selected": ["A", "C"]}`, `{"value": true}`, `{"text": "..."}`), so the
/// enum is untagged; the variant is recovered from the shape on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerPayload {
    /// Single-choice selection.
    Choice { selected: String },
    /// Multiple-choice selection.
    MultiChoice { selected: Vec<String> },
    /// True/false.
    Boolean { value: bool },
    /// Short or long free text.
    Text { text: String },
}

impl AnswerPayload {
    pub fn choice(option: impl Into<String>) -> Self {
        AnswerPayload::Choice {
            selected: option.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        AnswerPayload::Text { text: text.into() }
    }

    /// Whether the payload holds a real response (empty selections and
    /// blank text count as unanswered).
    pub fn is_answered(&self) -> bool {
        match self {
            AnswerPayload::Choice { selected } => !selected.is_empty(),
            AnswerPayload::MultiChoice { selected } => !selected.is_empty(),
            AnswerPayload::Boolean { .. } => true,
            AnswerPayload::Text { text } => !text.trim().is_empty(),
        }
    }
}

/// Persisted mirror of one question's answer for an attempt.
///
/// The exam state container owns the authoritative copy; this record only
/// survives reloads. `id` is assigned by the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub id: Option<i64>,
    pub attempt_id: i64,
    pub question_id: i64,
    pub answer: Option<AnswerPayload>,
    pub is_flagged: bool,
    pub time_spent_seconds: i64,
    pub sequence: i64,
    pub needs_sync: bool,
    pub last_sync_attempt: Option<DateTime<Utc>>,
}

/// Answer row as stored by the server (REST `GET /attempts/{id}/answers`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedAnswer {
    pub attempt_id: i64,
    pub question_id: i64,
    pub answer: Option<AnswerPayload>,
    pub is_flagged: bool,
    pub time_spent_seconds: i64,
    pub sequence: i64,
    pub saved_at: DateTime<Utc>,
}

/// DTO for the REST answer fallback (`POST /attempts/{id}/answers`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct SaveAnswerRequest {
    pub question_id: i64,
    pub answer: Option<AnswerPayload>,
    #[serde(default)]
    pub is_flagged: bool,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub time_spent_seconds: i64,
    #[validate(range(min = 1))]
    pub sequence: i64,
}
