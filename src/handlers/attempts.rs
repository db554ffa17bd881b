// src/handlers/attempts.rs

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use validator::Validate;

use crate::{
    config::Config,
    error::AppError,
    handlers::{answers::apply_checkpoint, exams::fetch_exam},
    models::{
        answer::SaveAnswerRequest,
        exam::{AttemptSnapshot, AttemptStatus, StartAttemptRequest},
        submission::{AttemptResult, SubmissionEnvelope},
    },
    utils::{
        crypto::{SubmissionCrypto, generate_salt},
        jwt::Claims,
    },
};

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct AttemptRow {
    pub id: i64,
    pub exam_id: i64,
    pub student_id: i64,
    pub username: String,
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub duration_minutes: i64,
    pub workstation_id: Option<String>,
    pub encryption_salt: String,
    pub submit_time: Option<DateTime<Utc>>,
    pub encryption_checksum: Option<String>,
}

impl AttemptRow {
    pub fn status(&self) -> Result<AttemptStatus, AppError> {
        self.status
            .parse()
            .map_err(|e: AppError| AppError::InternalServerError(e.to_string()))
    }

    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.start_time).num_seconds().max(0)
    }

    /// Server-authoritative remaining time, never negative.
    pub fn time_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.duration_minutes * 60 - self.elapsed_seconds(now)).max(0)
    }

    /// Fails unless the token's candidate owns this attempt. Foreign
    /// attempts look missing rather than forbidden.
    pub fn ensure_owner(&self, claims: &Claims) -> Result<(), AppError> {
        if claims.student_id()? != self.student_id {
            return Err(AppError::NotFound(format!("Attempt {} not found", self.id)));
        }
        Ok(())
    }

    pub fn ensure_open(&self) -> Result<(), AppError> {
        if !self.status()?.is_open() {
            return Err(AppError::Conflict(format!(
                "Attempt {} is already {}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Result<AttemptSnapshot, AppError> {
        Ok(AttemptSnapshot {
            id: self.id,
            student_id: self.student_id,
            exam_id: self.exam_id,
            status: self.status()?,
            start_time: Some(self.start_time),
            submit_time: self.submit_time,
            duration_minutes: self.duration_minutes,
            time_remaining_seconds: self.time_remaining(Utc::now()),
            workstation_id: self.workstation_id.clone(),
            encryption_salt: self.encryption_salt.clone(),
        })
    }
}

const ATTEMPT_COLUMNS: &str = "id, exam_id, student_id, username, status, start_time, \
     duration_minutes, workstation_id, encryption_salt, submit_time, encryption_checksum";

pub(crate) async fn load_attempt(pool: &SqlitePool, attempt_id: i64) -> Result<AttemptRow, AppError> {
    let sql = format!("SELECT {} FROM attempts WHERE id = ?", ATTEMPT_COLUMNS);
    sqlx::query_as::<_, AttemptRow>(&sql)
        .bind(attempt_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to load attempt {}: {:?}", attempt_id, e);
            AppError::InternalServerError(e.to_string())
        })?
        .ok_or_else(|| AppError::NotFound(format!("Attempt {} not found", attempt_id)))
}

/// Loads an attempt on behalf of the token holder.
pub(crate) async fn load_owned_attempt(
    pool: &SqlitePool,
    attempt_id: i64,
    claims: &Claims,
) -> Result<AttemptRow, AppError> {
    let attempt = load_attempt(pool, attempt_id).await?;
    attempt.ensure_owner(claims)?;
    Ok(attempt)
}

async fn count_answers(pool: &SqlitePool, attempt_id: i64) -> Result<i64, AppError> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM answers WHERE attempt_id = ?")
        .bind(attempt_id)
        .fetch_one(pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to count answers for attempt {}: {:?}", attempt_id, e);
            AppError::InternalServerError(e.to_string())
        })
}

async fn attempt_result(pool: &SqlitePool, attempt: &AttemptRow) -> Result<AttemptResult, AppError> {
    Ok(AttemptResult {
        attempt_id: attempt.id,
        status: attempt.status()?,
        submit_time: attempt.submit_time,
        answers_recorded: count_answers(pool, attempt.id).await?,
        encryption_checksum: attempt.encryption_checksum.clone(),
    })
}

/// Starts an attempt, or resumes the candidate's open one for this exam.
/// A fresh encryption salt is issued with every new attempt.
pub async fn start_attempt(
    State(pool): State<SqlitePool>,
    Extension(claims): Extension<Claims>,
    Path(exam_id): Path<i64>,
    Json(payload): Json<StartAttemptRequest>,
) -> Result<impl IntoResponse, AppError> {
    let student_id = claims.student_id()?;
    let exam = fetch_exam(&pool, exam_id).await?;

    let sql = format!(
        "SELECT {} FROM attempts WHERE exam_id = ? AND student_id = ? AND status IN ('not_started', 'in_progress') ORDER BY id DESC LIMIT 1",
        ATTEMPT_COLUMNS
    );
    let existing = sqlx::query_as::<_, AttemptRow>(&sql)
        .bind(exam_id)
        .bind(student_id)
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to look up open attempt: {:?}", e);
            AppError::InternalServerError(e.to_string())
        })?;

    if let Some(attempt) = existing {
        tracing::info!(
            "Candidate {} resumed attempt {} for exam {}",
            student_id,
            attempt.id,
            exam_id
        );
        return Ok((StatusCode::OK, Json(attempt.snapshot()?)));
    }

    let result = sqlx::query(
        r#"
        INSERT INTO attempts
            (exam_id, student_id, username, status, start_time, duration_minutes,
             workstation_id, encryption_salt)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(exam_id)
    .bind(student_id)
    .bind(&claims.username)
    .bind(AttemptStatus::InProgress.as_str())
    .bind(Utc::now())
    .bind(exam.duration_minutes)
    .bind(&payload.workstation_id)
    .bind(generate_salt())
    .execute(&pool)
    .await
    .map_err(|e| {
        tracing::error!("Failed to create attempt: {:?}", e);
        AppError::InternalServerError(e.to_string())
    })?;

    let attempt = load_attempt(&pool, result.last_insert_rowid()).await?;
    tracing::info!(
        "Candidate {} started attempt {} for exam {}",
        student_id,
        attempt.id,
        exam_id
    );

    Ok((StatusCode::CREATED, Json(attempt.snapshot()?)))
}

pub async fn get_attempt(
    State(pool): State<SqlitePool>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let attempt = load_owned_attempt(&pool, id, &claims).await?;
    Ok(Json(attempt.snapshot()?))
}

/// Accepts the encrypted submission.
///
/// The envelope is verified and opened with the attempt's key material, the
/// sealed answers are reconciled against the checkpoints already stored
/// (highest sequence wins), then the attempt is closed.
pub async fn submit_attempt(
    State(pool): State<SqlitePool>,
    State(config): State<Config>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
    Json(envelope): Json<SubmissionEnvelope>,
) -> Result<impl IntoResponse, AppError> {
    envelope
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let attempt = load_owned_attempt(&pool, id, &claims).await?;
    attempt.ensure_open()?;

    let answers = SubmissionCrypto::new(config.encryption_iterations)
        .open_answers_async(envelope.clone(), attempt.username.clone(), attempt.exam_id)
        .await
        .map_err(|e| {
            tracing::warn!("Rejected submission for attempt {}: {}", id, e);
            e
        })?;

    for answer in &answers {
        // Sequence 0 carries flag-only state; lift it so the row is valid.
        let request = SaveAnswerRequest {
            question_id: answer.question_id,
            answer: answer.answer.clone(),
            is_flagged: answer.is_flagged,
            time_spent_seconds: answer.time_spent_seconds.max(0),
            sequence: answer.sequence.max(1),
        };
        apply_checkpoint(&pool, id, &request).await?;
    }

    let now = Utc::now();
    let updated = sqlx::query(
        r#"
        UPDATE attempts
        SET status = ?, submit_time = ?, encrypted_answers = ?,
            encryption_timestamp = ?, encryption_checksum = ?
        WHERE id = ? AND status IN ('not_started', 'in_progress')
        "#,
    )
    .bind(AttemptStatus::Submitted.as_str())
    .bind(now)
    .bind(&envelope.encrypted_answers)
    .bind(&envelope.encryption_timestamp)
    .bind(&envelope.encryption_checksum)
    .bind(id)
    .execute(&pool)
    .await
    .map_err(|e| {
        tracing::error!("Failed to close attempt {}: {:?}", id, e);
        AppError::InternalServerError(e.to_string())
    })?;

    if updated.rows_affected() == 0 {
        return Err(AppError::Conflict(format!("Attempt {} is already submitted", id)));
    }

    tracing::info!(
        "Attempt {} submitted with {} sealed answers",
        id,
        answers.len()
    );

    let attempt = load_attempt(&pool, id).await?;
    Ok(Json(attempt_result(&pool, &attempt).await?))
}

pub async fn get_result(
    State(pool): State<SqlitePool>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let attempt = load_owned_attempt(&pool, id, &claims).await?;
    Ok(Json(attempt_result(&pool, &attempt).await?))
}
