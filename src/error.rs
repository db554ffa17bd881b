// src/error.rs

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// Global Application Error Enum.
/// Shared by the client engine and the reference server; the server maps it
/// to HTTP responses, the engine maps it to sync status and progress.
#[derive(Debug)]
pub enum AppError {
    // 500 Internal Server Error
    InternalServerError(String),

    // 400 Bad Request
    BadRequest(String),

    // 401 Unauthorized
    AuthError(String),

    // 404 Not Found
    NotFound(String),

    // 409 Conflict (e.g., attempt already submitted)
    Conflict(String),

    /// The durable local store cannot be opened or written.
    /// Never absorbed: offline resilience is gone when this happens.
    StoreUnavailable(String),

    /// Transport-level failure (socket, HTTP, DNS).
    Network(String),

    /// The checkpoint channel is not connected.
    Disconnected,

    /// No `checkpoint_ack` arrived within the ack window.
    AckTimeout { question_id: i64, sequence: i64 },

    /// The server answered a checkpoint with `checkpoint_error`.
    CheckpointRejected {
        question_id: i64,
        sequence: i64,
        reason: String,
    },

    /// Malformed or unexpected wire data.
    Protocol(String),

    Encryption(String),

    /// Authentication tag mismatch, bad key or corrupt envelope.
    Decryption(String),

    /// Non-success response from the REST API.
    Api { status: u16, message: String },
}

impl AppError {
    /// Errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Network(_)
                | AppError::Disconnected
                | AppError::AckTimeout { .. }
                | AppError::CheckpointRejected { .. }
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::AckTimeout {
                question_id,
                sequence,
            } => write!(
                f,
                "Acknowledgment timeout (question {}, sequence {})",
                question_id, sequence
            ),
            AppError::CheckpointRejected {
                question_id,
                sequence,
                reason,
            } => write!(
                f,
                "Checkpoint rejected (question {}, sequence {}): {}",
                question_id, sequence, reason
            ),
            AppError::Api { status, message } => write!(f, "HTTP {}: {}", status, message),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for AppError {}

/// Implements `IntoResponse` for `AppError`.
/// Converts the error into a JSON response with appropriate HTTP status code.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::InternalServerError(msg) | AppError::StoreUnavailable(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
            AppError::BadRequest(msg) | AppError::Protocol(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Decryption(msg) => (
                StatusCode::BAD_REQUEST,
                format!("Submission could not be decrypted: {}", msg),
            ),
            AppError::AuthError(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            other => {
                tracing::error!("Unexpected error in request path: {}", other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
        };
        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Converts `sqlx::Error` into `AppError::StoreUnavailable`.
/// Allows using `?` operator on database queries.
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::StoreUnavailable(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        AppError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Protocol(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Network(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Network(err.to_string())
    }
}

impl From<url::ParseError> for AppError {
    fn from(err: url::ParseError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}
