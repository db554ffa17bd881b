// src/handlers/ws.rs

//! Checkpoint channel endpoint: `GET /api/v1/ws/attempts/{id}?token=...`.

use std::time::Duration;

use axum::{
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use chrono::Utc;
use futures_util::{
    SinkExt, StreamExt,
    stream::SplitSink,
};
use serde::Deserialize;
use sqlx::SqlitePool;
use validator::Validate;

use crate::{
    error::AppError,
    handlers::{
        answers::{apply_checkpoint, apply_flag, check_question},
        attempts::{AttemptRow, load_attempt, load_owned_attempt},
        exams::fetch_exam,
    },
    models::{
        answer::SaveAnswerRequest,
        checkpoint::CheckpointAck,
        exam::ExamSnapshot,
        message::{ClientMessage, EVENT_TIME_EXPIRED, ServerMessage},
    },
    state::AppState,
    utils::jwt::verify_jwt,
};

#[derive(Debug, Deserialize)]
pub struct SocketQuery {
    pub token: String,
}

/// Authenticates from the `token` query parameter (browsers cannot set
/// headers on a WebSocket handshake) and upgrades.
pub async fn attempt_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<SocketQuery>,
) -> Result<Response, AppError> {
    let claims = verify_jwt(&query.token, &state.config.jwt_secret)?;
    let attempt = load_owned_attempt(&state.pool, id, &claims).await?;
    attempt.ensure_open()?;
    let exam = fetch_exam(&state.pool, attempt.exam_id).await?;

    tracing::info!("Checkpoint channel opened for attempt {}", id);
    Ok(ws.on_upgrade(move |socket| run_socket(socket, state, attempt, exam)))
}

async fn run_socket(socket: WebSocket, state: AppState, attempt: AttemptRow, exam: ExamSnapshot) {
    let (mut sender, mut receiver) = socket.split();

    let hello = ServerMessage::Connected {
        attempt_id: attempt.id,
        time_remaining_seconds: attempt.time_remaining(Utc::now()),
        server_time: Some(Utc::now()),
        heartbeat_interval: Some(state.config.heartbeat_interval_secs),
    };
    if send(&mut sender, &hello).await.is_err() {
        return;
    }

    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(state.config.heartbeat_interval_secs.max(1)));
    // The first tick fires immediately.
    heartbeat.tick().await;

    'socket: loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let replies =
                        handle_client_frame(&state.pool, &exam, attempt.id, text.as_str()).await;
                    for reply in &replies {
                        if send(&mut sender, reply).await.is_err() {
                            break 'socket;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("Socket error on attempt {}: {}", attempt.id, e);
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if send(&mut sender, &ServerMessage::Ping).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::info!("Checkpoint channel closed for attempt {}", attempt.id);
}

async fn send(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), AppError> {
    let text = serde_json::to_string(message)?;
    sender
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| AppError::Network(e.to_string()))
}

/// Processes one client frame and returns the replies, in order.
///
/// The attempt row is reloaded per frame so a submit on another connection
/// closes the channel for further checkpoints.
pub async fn handle_client_frame(
    pool: &SqlitePool,
    exam: &ExamSnapshot,
    attempt_id: i64,
    text: &str,
) -> Vec<ServerMessage> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("Invalid frame on attempt {}: {}", attempt_id, e);
            return vec![ServerMessage::Error {
                message: format!("Invalid message: {}", e),
                code: Some("invalid_message".to_string()),
            }];
        }
    };

    match message {
        ClientMessage::Checkpoint {
            question_id,
            answer,
            is_flagged,
            time_spent_seconds,
            sequence,
        } => {
            let request = SaveAnswerRequest {
                question_id,
                answer,
                is_flagged,
                time_spent_seconds,
                sequence,
            };
            match store_checkpoint(pool, exam, attempt_id, &request).await {
                Ok(ack) => vec![ServerMessage::CheckpointAck(ack)],
                Err(e) => {
                    tracing::warn!(
                        "Checkpoint {}|{}|{} rejected: {}",
                        attempt_id,
                        question_id,
                        sequence,
                        e
                    );
                    vec![ServerMessage::CheckpointError {
                        question_id,
                        sequence: Some(sequence),
                        reason: rejection_reason(&e),
                    }]
                }
            }
        }
        ClientMessage::TimeSync { .. } => match load_attempt(pool, attempt_id).await {
            Ok(attempt) => {
                let now = Utc::now();
                let remaining = attempt.time_remaining(now);
                let mut replies = vec![ServerMessage::TimeUpdate {
                    server_time: now,
                    time_remaining_seconds: remaining,
                    elapsed_seconds: attempt.elapsed_seconds(now),
                    is_expired: remaining == 0,
                }];
                if remaining == 0 {
                    replies.push(ServerMessage::ExamEvent {
                        event: EVENT_TIME_EXPIRED.to_string(),
                        data: None,
                    });
                }
                replies
            }
            Err(e) => vec![ServerMessage::Error {
                message: e.to_string(),
                code: Some("time_sync_failed".to_string()),
            }],
        },
        ClientMessage::Flag {
            question_id,
            is_flagged,
        } => match apply_flag(pool, attempt_id, question_id, is_flagged).await {
            Ok(()) => Vec::new(),
            Err(e) => vec![ServerMessage::Error {
                message: e.to_string(),
                code: Some("flag_failed".to_string()),
            }],
        },
        ClientMessage::Pong { .. } => Vec::new(),
    }
}

async fn store_checkpoint(
    pool: &SqlitePool,
    exam: &ExamSnapshot,
    attempt_id: i64,
    request: &SaveAnswerRequest,
) -> Result<CheckpointAck, AppError> {
    request
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    check_question(exam, request)?;

    let attempt = load_attempt(pool, attempt_id).await?;
    attempt.ensure_open()?;

    let (_, saved_at) = apply_checkpoint(pool, attempt_id, request).await?;
    Ok(CheckpointAck {
        question_id: request.question_id,
        sequence: request.sequence,
        saved_at,
        time_remaining_seconds: attempt.time_remaining(Utc::now()),
    })
}

fn rejection_reason(error: &AppError) -> String {
    match error {
        AppError::BadRequest(msg) | AppError::Conflict(msg) | AppError::NotFound(msg) => {
            msg.clone()
        }
        _ => "Internal Server Error".to_string(),
    }
}
