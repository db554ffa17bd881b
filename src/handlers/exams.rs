// src/handlers/exams.rs

use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use sqlx::{SqlitePool, types::Json as SqlJson};
use validator::Validate;

use crate::{
    error::AppError,
    models::{exam::ExamSnapshot, question::Question},
};

#[derive(sqlx::FromRow)]
struct ExamRow {
    id: i64,
    exam_code: String,
    title: String,
    description: String,
    duration_minutes: i64,
    total_marks: f64,
    passing_marks: f64,
    questions: SqlJson<Vec<Question>>,
}

impl From<ExamRow> for ExamSnapshot {
    fn from(row: ExamRow) -> Self {
        ExamSnapshot {
            id: row.id,
            exam_code: row.exam_code,
            title: row.title,
            description: row.description,
            duration_minutes: row.duration_minutes,
            total_marks: row.total_marks,
            passing_marks: row.passing_marks,
            questions: row.questions.0,
        }
    }
}

pub async fn fetch_exam(pool: &SqlitePool, exam_id: i64) -> Result<ExamSnapshot, AppError> {
    let row = sqlx::query_as::<_, ExamRow>(
        r#"
        SELECT id, exam_code, title, description, duration_minutes,
               total_marks, passing_marks, questions
        FROM exams WHERE id = ?
        "#,
    )
    .bind(exam_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| {
        tracing::error!("Failed to fetch exam {}: {:?}", exam_id, e);
        AppError::InternalServerError(e.to_string())
    })?;

    row.map(ExamSnapshot::from)
        .ok_or_else(|| AppError::NotFound(format!("Exam {} not found", exam_id)))
}

/// Inserts an exam paper (seeding and tests; authoring lives elsewhere).
/// The snapshot's `id` is ignored and the new id is returned.
pub async fn insert_exam(pool: &SqlitePool, exam: &ExamSnapshot) -> Result<i64, AppError> {
    for question in &exam.questions {
        question
            .validate()
            .map_err(|e| AppError::BadRequest(e.to_string()))?;
    }

    let result = sqlx::query(
        r#"
        INSERT INTO exams
            (exam_code, title, description, duration_minutes, total_marks, passing_marks, questions)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&exam.exam_code)
    .bind(&exam.title)
    .bind(&exam.description)
    .bind(exam.duration_minutes)
    .bind(exam.total_marks)
    .bind(exam.passing_marks)
    .bind(SqlJson(&exam.questions))
    .execute(pool)
    .await
    .map_err(|e| {
        if let sqlx::Error::Database(db_err) = &e {
            if db_err.is_unique_violation() {
                return AppError::Conflict(format!("Exam code {} already exists", exam.exam_code));
            }
        }
        tracing::error!("Failed to insert exam: {:?}", e);
        AppError::InternalServerError(e.to_string())
    })?;

    Ok(result.last_insert_rowid())
}

/// Returns the exam paper (questions without answer keys).
pub async fn get_exam(
    State(pool): State<SqlitePool>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let exam = fetch_exam(&pool, id).await?;
    Ok(Json(exam))
}
