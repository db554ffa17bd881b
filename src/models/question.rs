// src/models/question.rs

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::answer::AnswerPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    McqSingle,
    McqMultiple,
    TrueFalse,
    ShortAnswer,
    LongAnswer,
}

impl QuestionType {
    /// Whether an answer of this shape is valid for the question type.
    pub fn accepts(&self, answer: &AnswerPayload) -> bool {
        matches!(
            (self, answer),
            (QuestionType::McqSingle, AnswerPayload::Choice { .. })
                | (QuestionType::McqMultiple, AnswerPayload::MultiChoice { .. })
                | (QuestionType::TrueFalse, AnswerPayload::Boolean { .. })
                | (QuestionType::ShortAnswer, AnswerPayload::Text { .. })
                | (QuestionType::LongAnswer, AnswerPayload::Text { .. })
        )
    }
}

/// A question as delivered to the candidate (no answer key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Question {
    pub id: i64,

    #[validate(length(min = 1, max = 2000))]
    pub question_text: String,

    pub question_type: QuestionType,

    pub marks: f64,

    #[serde(default)]
    pub options: Option<Vec<String>>,

    pub order_number: i32,
}
