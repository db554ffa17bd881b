// src/handlers/answers.rs

use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use validator::Validate;

use crate::{
    error::AppError,
    handlers::{attempts::load_owned_attempt, exams::fetch_exam},
    models::{
        answer::{SaveAnswerRequest, SavedAnswer},
        checkpoint::CheckpointAck,
        exam::ExamSnapshot,
    },
    utils::jwt::Claims,
};

/// How a checkpoint landed against the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointApplied {
    /// Higher sequence than anything stored; the row was written.
    Applied,
    /// Same sequence as the stored row; a redelivery.
    Duplicate,
    /// Lower sequence; the stored row is newer and kept.
    Stale,
}

#[derive(sqlx::FromRow)]
struct AnswerRow {
    attempt_id: i64,
    question_id: i64,
    answer: String,
    is_flagged: bool,
    time_spent_seconds: i64,
    sequence: i64,
    saved_at: DateTime<Utc>,
}

impl TryFrom<AnswerRow> for SavedAnswer {
    type Error = AppError;

    fn try_from(row: AnswerRow) -> Result<Self, Self::Error> {
        Ok(SavedAnswer {
            attempt_id: row.attempt_id,
            question_id: row.question_id,
            answer: serde_json::from_str(&row.answer)
                .map_err(|e| AppError::InternalServerError(e.to_string()))?,
            is_flagged: row.is_flagged,
            time_spent_seconds: row.time_spent_seconds,
            sequence: row.sequence,
            saved_at: row.saved_at,
        })
    }
}

/// Checks that the checkpoint targets a question of the exam and carries an
/// answer of the right shape.
pub(crate) fn check_question(
    exam: &ExamSnapshot,
    request: &SaveAnswerRequest,
) -> Result<(), AppError> {
    let question = exam
        .questions
        .iter()
        .find(|q| q.id == request.question_id)
        .ok_or_else(|| {
            AppError::BadRequest(format!(
                "Question {} is not part of exam {}",
                request.question_id, exam.id
            ))
        })?;

    if let Some(answer) = &request.answer {
        if !question.question_type.accepts(answer) {
            return Err(AppError::BadRequest(format!(
                "Answer shape does not match question {}",
                question.id
            )));
        }
    }
    Ok(())
}

/// Stores a checkpoint if it is newer than the stored row.
///
/// Returns the outcome and the `saved_at` of the row now on record.
pub async fn apply_checkpoint(
    pool: &SqlitePool,
    attempt_id: i64,
    request: &SaveAnswerRequest,
) -> Result<(CheckpointApplied, DateTime<Utc>), AppError> {
    let mut tx = pool.begin().await.map_err(|e| {
        tracing::error!("Failed to begin transaction: {:?}", e);
        AppError::InternalServerError(e.to_string())
    })?;

    let current = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
        "SELECT sequence, saved_at FROM answers WHERE attempt_id = ? AND question_id = ?",
    )
    .bind(attempt_id)
    .bind(request.question_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!("Failed to read answer row: {:?}", e);
        AppError::InternalServerError(e.to_string())
    })?;

    if let Some((sequence, saved_at)) = current {
        if request.sequence == sequence {
            return Ok((CheckpointApplied::Duplicate, saved_at));
        }
        if request.sequence < sequence {
            tracing::debug!(
                "Ignoring stale checkpoint {}|{}|{} (stored {})",
                attempt_id,
                request.question_id,
                request.sequence,
                sequence
            );
            return Ok((CheckpointApplied::Stale, saved_at));
        }
    }

    let answer = serde_json::to_string(&request.answer)
        .map_err(|e| AppError::InternalServerError(e.to_string()))?;
    let saved_at = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO answers
            (attempt_id, question_id, answer, is_flagged, time_spent_seconds, sequence, saved_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (attempt_id, question_id) DO UPDATE SET
            answer = excluded.answer,
            is_flagged = excluded.is_flagged,
            time_spent_seconds = excluded.time_spent_seconds,
            sequence = excluded.sequence,
            saved_at = excluded.saved_at
        WHERE excluded.sequence > answers.sequence
        "#,
    )
    .bind(attempt_id)
    .bind(request.question_id)
    .bind(answer)
    .bind(request.is_flagged)
    .bind(request.time_spent_seconds)
    .bind(request.sequence)
    .bind(saved_at)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!("Failed to store checkpoint: {:?}", e);
        AppError::InternalServerError(e.to_string())
    })?;

    tx.commit().await.map_err(|e| {
        tracing::error!("Failed to commit checkpoint: {:?}", e);
        AppError::InternalServerError(e.to_string())
    })?;

    Ok((CheckpointApplied::Applied, saved_at))
}

/// Sets the review flag without touching the answer. A missing row is
/// created empty at sequence 0 so the first real checkpoint supersedes it.
pub async fn apply_flag(
    pool: &SqlitePool,
    attempt_id: i64,
    question_id: i64,
    is_flagged: bool,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO answers
            (attempt_id, question_id, answer, is_flagged, time_spent_seconds, sequence, saved_at)
        VALUES (?, ?, 'null', ?, 0, 0, ?)
        ON CONFLICT (attempt_id, question_id) DO UPDATE SET
            is_flagged = excluded.is_flagged
        "#,
    )
    .bind(attempt_id)
    .bind(question_id)
    .bind(is_flagged)
    .bind(Utc::now())
    .execute(pool)
    .await
    .map_err(|e| {
        tracing::error!("Failed to store flag: {:?}", e);
        AppError::InternalServerError(e.to_string())
    })?;
    Ok(())
}

/// REST fallback for a single checkpoint. Replies with the same ack the
/// channel would send; duplicates and stale sequences are acked too.
pub async fn save_answer(
    State(pool): State<SqlitePool>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
    Json(payload): Json<SaveAnswerRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let attempt = load_owned_attempt(&pool, id, &claims).await?;
    attempt.ensure_open()?;

    let exam = fetch_exam(&pool, attempt.exam_id).await?;
    check_question(&exam, &payload)?;

    let (_, saved_at) = apply_checkpoint(&pool, id, &payload).await?;

    Ok(Json(CheckpointAck {
        question_id: payload.question_id,
        sequence: payload.sequence,
        saved_at,
        time_remaining_seconds: attempt.time_remaining(Utc::now()),
    }))
}

pub async fn list_answers(
    State(pool): State<SqlitePool>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    load_owned_attempt(&pool, id, &claims).await?;

    let rows = sqlx::query_as::<_, AnswerRow>(
        r#"
        SELECT attempt_id, question_id, answer, is_flagged, time_spent_seconds, sequence, saved_at
        FROM answers
        WHERE attempt_id = ?
        ORDER BY question_id
        "#,
    )
    .bind(id)
    .fetch_all(&pool)
    .await
    .map_err(|e| {
        tracing::error!("Failed to list answers for attempt {}: {:?}", id, e);
        AppError::InternalServerError(e.to_string())
    })?;

    let answers = rows
        .into_iter()
        .map(SavedAnswer::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(answers))
}
