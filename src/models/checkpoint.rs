// src/models/checkpoint.rs

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::AppError,
    models::{
        answer::{AnswerPayload, SaveAnswerRequest},
        message::ClientMessage,
    },
};

/// Identity of one checkpoint: `attemptId|questionId|sequence`.
///
/// At most one queue entry may exist per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointKey {
    pub attempt_id: i64,
    pub question_id: i64,
    pub sequence: i64,
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.attempt_id, self.question_id, self.sequence)
    }
}

impl FromStr for CheckpointKey {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('|');
        let mut next = |name: &str| -> Result<i64, AppError> {
            parts
                .next()
                .ok_or_else(|| AppError::Protocol(format!("checkpoint key {:?} lacks {}", s, name)))?
                .parse::<i64>()
                .map_err(|e| AppError::Protocol(format!("checkpoint key {:?}: {}", s, e)))
        };
        let key = CheckpointKey {
            attempt_id: next("attempt id")?,
            question_id: next("question id")?,
            sequence: next("sequence")?,
        };
        if parts.next().is_some() {
            return Err(AppError::Protocol(format!(
                "checkpoint key {:?} has trailing parts",
                s
            )));
        }
        Ok(key)
    }
}

/// One answer mutation, ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub attempt_id: i64,
    pub question_id: i64,
    pub answer: Option<AnswerPayload>,
    pub is_flagged: bool,
    pub time_spent_seconds: i64,
    pub sequence: i64,
}

impl Checkpoint {
    pub fn key(&self) -> CheckpointKey {
        CheckpointKey {
            attempt_id: self.attempt_id,
            question_id: self.question_id,
            sequence: self.sequence,
        }
    }

    pub fn to_request(&self) -> SaveAnswerRequest {
        SaveAnswerRequest {
            question_id: self.question_id,
            answer: self.answer.clone(),
            is_flagged: self.is_flagged,
            time_spent_seconds: self.time_spent_seconds,
            sequence: self.sequence,
        }
    }

    pub fn to_message(&self) -> ClientMessage {
        ClientMessage::Checkpoint {
            question_id: self.question_id,
            answer: self.answer.clone(),
            is_flagged: self.is_flagged,
            time_spent_seconds: self.time_spent_seconds,
            sequence: self.sequence,
        }
    }
}

/// Retry-queue entry for a checkpoint that could not be delivered at once.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCheckpoint {
    pub key: CheckpointKey,
    pub checkpoint: Checkpoint,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

/// A checkpoint that exhausted its retries. Kept for manual reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedCheckpoint {
    pub key: CheckpointKey,
    pub checkpoint: Checkpoint,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub failed_at: DateTime<Utc>,
}

/// Server acknowledgement of a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointAck {
    pub question_id: i64,
    pub sequence: i64,
    pub saved_at: DateTime<Utc>,
    pub time_remaining_seconds: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        let key = CheckpointKey {
            attempt_id: 12,
            question_id: 7,
            sequence: 2,
        };
        assert_eq!(key.to_string(), "12|7|2");
        assert_eq!("12|7|2".parse::<CheckpointKey>().unwrap(), key);
    }

    #[test]
    fn test_key_rejects_malformed() {
        assert!("12|7".parse::<CheckpointKey>().is_err());
        assert!("12|7|2|9".parse::<CheckpointKey>().is_err());
        assert!("12|x|2".parse::<CheckpointKey>().is_err());
    }
}
