// src/models/submission.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::{answer::AnswerPayload, exam::AttemptStatus};

pub const PAYLOAD_VERSION: &str = "1.0";

/// Final state of one question as it goes into the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedAnswer {
    pub question_id: i64,
    pub answer: Option<AnswerPayload>,
    pub is_flagged: bool,
    pub time_spent_seconds: i64,
    pub sequence: i64,
}

/// Plaintext sealed inside the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionPayload {
    pub answers: Vec<SubmittedAnswer>,
    pub username: String,
    pub exam_id: i64,
    pub timestamp: String,
    pub version: String,
}

/// The encrypted, checksummed submission. Created once per attempt.
///
/// `encrypted_answers` is `base64(salt ‖ nonce ‖ ciphertext)`;
/// `encryption_checksum` is `base64(sha256(encrypted_answers))`;
/// `encryption_timestamp` is the ISO 8601 string mixed into the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct SubmissionEnvelope {
    #[validate(length(min = 1))]
    pub encrypted_answers: String,
    #[validate(length(min = 1, max = 64))]
    pub encryption_timestamp: String,
    #[validate(length(equal = 44))]
    pub encryption_checksum: String,
}

/// Server view of an attempt after (or before) submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptResult {
    pub attempt_id: i64,
    pub status: AttemptStatus,
    pub submit_time: Option<DateTime<Utc>>,
    pub answers_recorded: i64,
    pub encryption_checksum: Option<String>,
}
