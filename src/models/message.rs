// src/models/message.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{answer::AnswerPayload, checkpoint::CheckpointAck};

/// Frames sent by the client over the checkpoint channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Checkpoint {
        question_id: i64,
        answer: Option<AnswerPayload>,
        #[serde(default)]
        is_flagged: bool,
        #[serde(default)]
        time_spent_seconds: i64,
        sequence: i64,
    },
    TimeSync {
        client_timestamp: DateTime<Utc>,
    },
    Flag {
        question_id: i64,
        is_flagged: bool,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// Frames sent by the server over the checkpoint channel.
///
/// Unknown fields are ignored; unknown `type`s fail to decode and are dropped
/// by the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        attempt_id: i64,
        time_remaining_seconds: i64,
        #[serde(default)]
        server_time: Option<DateTime<Utc>>,
        #[serde(default)]
        heartbeat_interval: Option<u64>,
    },
    CheckpointAck(CheckpointAck),
    CheckpointError {
        question_id: i64,
        #[serde(default)]
        sequence: Option<i64>,
        reason: String,
    },
    TimeUpdate {
        server_time: DateTime<Utc>,
        time_remaining_seconds: i64,
        elapsed_seconds: i64,
        is_expired: bool,
    },
    Ping,
    Notification {
        title: String,
        message: String,
        severity: Severity,
    },
    ExamEvent {
        event: String,
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
        #[serde(default)]
        code: Option<String>,
    },
}

impl ServerMessage {
    /// The `type` discriminator, used to route per-type subscriptions.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::CheckpointAck(_) => "checkpoint_ack",
            ServerMessage::CheckpointError { .. } => "checkpoint_error",
            ServerMessage::TimeUpdate { .. } => "time_update",
            ServerMessage::Ping => "ping",
            ServerMessage::Notification { .. } => "notification",
            ServerMessage::ExamEvent { .. } => "exam_event",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// Exam event announcing that the server clock ran out.
pub const EVENT_TIME_EXPIRED: &str = "time_expired";
