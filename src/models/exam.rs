// src/models/exam.rs

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::AppError, models::question::Question};

/// Cached copy of an exam paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamSnapshot {
    pub id: i64,
    pub exam_code: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub duration_minutes: i64,
    pub total_marks: f64,
    pub passing_marks: f64,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    NotStarted,
    InProgress,
    Submitted,
    Graded,
    Expired,
    Cancelled,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::NotStarted => "not_started",
            AttemptStatus::InProgress => "in_progress",
            AttemptStatus::Submitted => "submitted",
            AttemptStatus::Graded => "graded",
            AttemptStatus::Expired => "expired",
            AttemptStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the attempt still accepts checkpoints.
    pub fn is_open(&self) -> bool {
        matches!(self, AttemptStatus::NotStarted | AttemptStatus::InProgress)
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(AttemptStatus::NotStarted),
            "in_progress" => Ok(AttemptStatus::InProgress),
            "submitted" => Ok(AttemptStatus::Submitted),
            "graded" => Ok(AttemptStatus::Graded),
            "expired" => Ok(AttemptStatus::Expired),
            "cancelled" => Ok(AttemptStatus::Cancelled),
            other => Err(AppError::Protocol(format!("unknown attempt status {:?}", other))),
        }
    }
}

/// Cached copy of a candidate's attempt.
///
/// `encryption_salt` is the per-attempt random salt (base64) issued by the
/// server at attempt start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSnapshot {
    pub id: i64,
    pub student_id: i64,
    pub exam_id: i64,
    pub status: AttemptStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub submit_time: Option<DateTime<Utc>>,
    pub duration_minutes: i64,
    pub time_remaining_seconds: i64,
    #[serde(default)]
    pub workstation_id: Option<String>,
    pub encryption_salt: String,
}

/// DTO for starting an attempt.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StartAttemptRequest {
    #[serde(default)]
    pub workstation_id: Option<String>,
}
