// src/store.rs

//! Durable local store: exam and attempt snapshots, answer mirrors, the
//! checkpoint retry queue, the failed-checkpoint ledger and sync metadata.
//!
//! Backed by an embedded SQLite database. The pool is opened lazily behind
//! an initialization guard, so every operation may be called before `init`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{
    FromRow, SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    types::Json,
};
use tokio::sync::OnceCell;

use crate::{
    error::AppError,
    models::{
        answer::{AnswerPayload, AnswerRecord},
        checkpoint::{Checkpoint, CheckpointKey, FailedCheckpoint, QueuedCheckpoint},
        exam::{AttemptSnapshot, AttemptStatus, ExamSnapshot},
        sync::SyncStatus,
    },
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations/local");

const META_LAST_SYNC_TIME: &str = "lastSyncTime";
const META_SYNC_STATUS: &str = "syncStatus";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageInfo {
    pub exams_count: i64,
    pub attempts_count: i64,
    pub answers_count: i64,
    pub queued_count: i64,
    pub failed_count: i64,
}

#[derive(FromRow)]
struct SnapshotRow {
    snapshot: String,
}

#[derive(FromRow)]
struct AnswerRow {
    id: i64,
    attempt_id: i64,
    question_id: i64,
    answer: Json<Option<AnswerPayload>>,
    is_flagged: bool,
    time_spent_seconds: i64,
    sequence: i64,
    needs_sync: bool,
    last_sync_attempt: Option<DateTime<Utc>>,
}

impl From<AnswerRow> for AnswerRecord {
    fn from(row: AnswerRow) -> Self {
        AnswerRecord {
            id: Some(row.id),
            attempt_id: row.attempt_id,
            question_id: row.question_id,
            answer: row.answer.0,
            is_flagged: row.is_flagged,
            time_spent_seconds: row.time_spent_seconds,
            sequence: row.sequence,
            needs_sync: row.needs_sync,
            last_sync_attempt: row.last_sync_attempt,
        }
    }
}

#[derive(FromRow)]
struct QueueRow {
    key: String,
    attempt_id: i64,
    question_id: i64,
    answer: Json<Option<AnswerPayload>>,
    is_flagged: bool,
    time_spent_seconds: i64,
    sequence: i64,
    created_at: DateTime<Utc>,
    retry_count: i64,
    last_error: Option<String>,
}

impl QueueRow {
    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            attempt_id: self.attempt_id,
            question_id: self.question_id,
            answer: self.answer.0.clone(),
            is_flagged: self.is_flagged,
            time_spent_seconds: self.time_spent_seconds,
            sequence: self.sequence,
        }
    }
}

impl TryFrom<QueueRow> for QueuedCheckpoint {
    type Error = AppError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        Ok(QueuedCheckpoint {
            key: row.key.parse()?,
            checkpoint: row.checkpoint(),
            created_at: row.created_at,
            retry_count: row.retry_count.max(0) as u32,
            last_error: row.last_error,
        })
    }
}

#[derive(FromRow)]
struct FailedRow {
    #[sqlx(flatten)]
    queued: QueueRow,
    failed_at: DateTime<Utc>,
}

pub struct LocalStore {
    url: String,
    pool: OnceCell<SqlitePool>,
}

impl LocalStore {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool: OnceCell::new(),
        }
    }

    /// A private database that lives as long as the store.
    pub fn in_memory() -> Self {
        Self::new("sqlite::memory:")
    }

    /// Opens the database and applies migrations. Idempotent; concurrent
    /// callers wait on the same initialization.
    pub async fn init(&self) -> Result<(), AppError> {
        self.db().await.map(|_| ())
    }

    async fn db(&self) -> Result<&SqlitePool, AppError> {
        self.pool
            .get_or_try_init(|| async {
                let options = SqliteConnectOptions::from_str(&self.url)?
                    .create_if_missing(true)
                    .foreign_keys(true);

                // One connection: in-memory databases are per-connection, and
                // SQLite has a single writer anyway.
                let pool = SqlitePoolOptions::new()
                    .max_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(options)
                    .await
                    .map_err(|e| {
                        tracing::error!("Failed to open local store {}: {:?}", self.url, e);
                        AppError::StoreUnavailable(e.to_string())
                    })?;

                MIGRATOR.run(&pool).await?;
                tracing::info!("Local store initialized ({})", self.url);
                Ok::<_, AppError>(pool)
            })
            .await
    }

    // ===== EXAM OPERATIONS =====

    pub async fn put_exam(&self, exam: &ExamSnapshot) -> Result<(), AppError> {
        let db = self.db().await?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO exams (id, exam_code, snapshot, updated_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(exam.id)
        .bind(&exam.exam_code)
        .bind(serde_json::to_string(exam)?)
        .bind(Utc::now())
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn get_exam(&self, exam_id: i64) -> Result<Option<ExamSnapshot>, AppError> {
        let db = self.db().await?;
        let row = sqlx::query_as::<_, SnapshotRow>("SELECT snapshot FROM exams WHERE id = ?")
            .bind(exam_id)
            .fetch_optional(db)
            .await?;
        row.map(|r| decode_snapshot(&r.snapshot)).transpose()
    }

    pub async fn get_exam_by_code(&self, exam_code: &str) -> Result<Option<ExamSnapshot>, AppError> {
        let db = self.db().await?;
        let row =
            sqlx::query_as::<_, SnapshotRow>("SELECT snapshot FROM exams WHERE exam_code = ?")
                .bind(exam_code)
                .fetch_optional(db)
                .await?;
        row.map(|r| decode_snapshot(&r.snapshot)).transpose()
    }

    pub async fn delete_exam(&self, exam_id: i64) -> Result<(), AppError> {
        let db = self.db().await?;
        sqlx::query("DELETE FROM exams WHERE id = ?")
            .bind(exam_id)
            .execute(db)
            .await?;
        Ok(())
    }

    // ===== ATTEMPT OPERATIONS =====

    pub async fn put_attempt(&self, attempt: &AttemptSnapshot) -> Result<(), AppError> {
        let db = self.db().await?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO attempts (id, exam_id, status, snapshot, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.exam_id)
        .bind(attempt.status.as_str())
        .bind(serde_json::to_string(attempt)?)
        .bind(Utc::now())
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn get_attempt(&self, attempt_id: i64) -> Result<Option<AttemptSnapshot>, AppError> {
        let db = self.db().await?;
        let row = sqlx::query_as::<_, SnapshotRow>("SELECT snapshot FROM attempts WHERE id = ?")
            .bind(attempt_id)
            .fetch_optional(db)
            .await?;
        row.map(|r| decode_snapshot(&r.snapshot)).transpose()
    }

    pub async fn attempts_by_exam(&self, exam_id: i64) -> Result<Vec<AttemptSnapshot>, AppError> {
        let db = self.db().await?;
        let rows = sqlx::query_as::<_, SnapshotRow>(
            "SELECT snapshot FROM attempts WHERE exam_id = ? ORDER BY id",
        )
        .bind(exam_id)
        .fetch_all(db)
        .await?;
        rows.iter().map(|r| decode_snapshot(&r.snapshot)).collect()
    }

    pub async fn attempts_by_status(
        &self,
        status: AttemptStatus,
    ) -> Result<Vec<AttemptSnapshot>, AppError> {
        let db = self.db().await?;
        let rows = sqlx::query_as::<_, SnapshotRow>(
            "SELECT snapshot FROM attempts WHERE status = ? ORDER BY id",
        )
        .bind(status.as_str())
        .fetch_all(db)
        .await?;
        rows.iter().map(|r| decode_snapshot(&r.snapshot)).collect()
    }

    pub async fn delete_attempt(&self, attempt_id: i64) -> Result<(), AppError> {
        let db = self.db().await?;
        sqlx::query("DELETE FROM attempts WHERE id = ?")
            .bind(attempt_id)
            .execute(db)
            .await?;
        Ok(())
    }

    // ===== ANSWER OPERATIONS =====

    /// Upserts the mirror for `(attempt, question)` and returns its id.
    /// A mirror never moves back to a lower sequence.
    pub async fn put_answer(&self, record: &AnswerRecord) -> Result<i64, AppError> {
        let db = self.db().await?;
        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO answers
                (attempt_id, question_id, answer, is_flagged, time_spent_seconds,
                 sequence, needs_sync, last_sync_attempt)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (attempt_id, question_id) DO UPDATE SET
                answer = excluded.answer,
                is_flagged = excluded.is_flagged,
                time_spent_seconds = excluded.time_spent_seconds,
                sequence = excluded.sequence,
                needs_sync = excluded.needs_sync,
                last_sync_attempt = excluded.last_sync_attempt
            WHERE excluded.sequence >= answers.sequence
            RETURNING id
            "#,
        )
        .bind(record.attempt_id)
        .bind(record.question_id)
        .bind(Json(&record.answer))
        .bind(record.is_flagged)
        .bind(record.time_spent_seconds)
        .bind(record.sequence)
        .bind(record.needs_sync)
        .bind(record.last_sync_attempt)
        .fetch_optional(db)
        .await?;

        if let Some((id,)) = inserted {
            return Ok(id);
        }

        tracing::debug!(
            "Kept newer answer mirror for attempt {} question {} (incoming sequence {})",
            record.attempt_id,
            record.question_id,
            record.sequence
        );
        let (id,): (i64,) =
            sqlx::query_as("SELECT id FROM answers WHERE attempt_id = ? AND question_id = ?")
                .bind(record.attempt_id)
                .bind(record.question_id)
                .fetch_one(db)
                .await?;
        Ok(id)
    }

    pub async fn get_answer(&self, answer_id: i64) -> Result<Option<AnswerRecord>, AppError> {
        let db = self.db().await?;
        let row = sqlx::query_as::<_, AnswerRow>("SELECT * FROM answers WHERE id = ?")
            .bind(answer_id)
            .fetch_optional(db)
            .await?;
        Ok(row.map(AnswerRecord::from))
    }

    pub async fn answer_for(
        &self,
        attempt_id: i64,
        question_id: i64,
    ) -> Result<Option<AnswerRecord>, AppError> {
        let db = self.db().await?;
        let row = sqlx::query_as::<_, AnswerRow>(
            "SELECT * FROM answers WHERE attempt_id = ? AND question_id = ?",
        )
        .bind(attempt_id)
        .bind(question_id)
        .fetch_optional(db)
        .await?;
        Ok(row.map(AnswerRecord::from))
    }

    pub async fn answers_by_attempt(&self, attempt_id: i64) -> Result<Vec<AnswerRecord>, AppError> {
        let db = self.db().await?;
        let rows = sqlx::query_as::<_, AnswerRow>(
            "SELECT * FROM answers WHERE attempt_id = ? ORDER BY question_id",
        )
        .bind(attempt_id)
        .fetch_all(db)
        .await?;
        Ok(rows.into_iter().map(AnswerRecord::from).collect())
    }

    pub async fn unsynced_answers(&self) -> Result<Vec<AnswerRecord>, AppError> {
        let db = self.db().await?;
        let rows = sqlx::query_as::<_, AnswerRow>(
            "SELECT * FROM answers WHERE needs_sync = TRUE ORDER BY attempt_id, question_id",
        )
        .fetch_all(db)
        .await?;
        Ok(rows.into_iter().map(AnswerRecord::from).collect())
    }

    /// Marks the mirror synced if the acknowledged sequence covers it.
    pub async fn mark_answer_synced(
        &self,
        attempt_id: i64,
        question_id: i64,
        sequence: i64,
    ) -> Result<bool, AppError> {
        let db = self.db().await?;
        let result = sqlx::query(
            r#"
            UPDATE answers SET needs_sync = FALSE, last_sync_attempt = ?
            WHERE attempt_id = ? AND question_id = ? AND sequence <= ?
            "#,
        )
        .bind(Utc::now())
        .bind(attempt_id)
        .bind(question_id)
        .bind(sequence)
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_answer(&self, answer_id: i64) -> Result<(), AppError> {
        let db = self.db().await?;
        sqlx::query("DELETE FROM answers WHERE id = ?")
            .bind(answer_id)
            .execute(db)
            .await?;
        Ok(())
    }

    // ===== CHECKPOINT QUEUE OPERATIONS =====

    /// Appends a checkpoint to the retry queue. Returns `false` when an entry
    /// with the same key is already queued; the existing entry is left as is.
    pub async fn enqueue_checkpoint(&self, checkpoint: &Checkpoint) -> Result<bool, AppError> {
        let db = self.db().await?;
        let key = checkpoint.key();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO checkpoint_queue
                (key, attempt_id, question_id, answer, is_flagged, time_spent_seconds,
                 sequence, created_at, retry_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(key.to_string())
        .bind(checkpoint.attempt_id)
        .bind(checkpoint.question_id)
        .bind(Json(&checkpoint.answer))
        .bind(checkpoint.is_flagged)
        .bind(checkpoint.time_spent_seconds)
        .bind(checkpoint.sequence)
        .bind(Utc::now())
        .execute(db)
        .await?;

        let inserted = result.rows_affected() == 1;
        if inserted {
            tracing::debug!("Queued checkpoint {}", key);
        } else {
            tracing::debug!("Checkpoint {} already queued", key);
        }
        Ok(inserted)
    }

    /// Queued checkpoints, optionally for one attempt, in ascending sequence order.
    pub async fn list_queued(
        &self,
        attempt_id: Option<i64>,
    ) -> Result<Vec<QueuedCheckpoint>, AppError> {
        let db = self.db().await?;
        let rows = sqlx::query_as::<_, QueueRow>(
            r#"
            SELECT * FROM checkpoint_queue
            WHERE (?1 IS NULL OR attempt_id = ?1)
            ORDER BY sequence ASC, created_at ASC, attempt_id ASC, question_id ASC
            "#,
        )
        .bind(attempt_id)
        .fetch_all(db)
        .await?;
        rows.into_iter().map(QueuedCheckpoint::try_from).collect()
    }

    pub async fn queued_count(&self, attempt_id: Option<i64>) -> Result<i64, AppError> {
        let db = self.db().await?;
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM checkpoint_queue WHERE (?1 IS NULL OR attempt_id = ?1)",
        )
        .bind(attempt_id)
        .fetch_one(db)
        .await?;
        Ok(count)
    }

    pub async fn remove_from_queue(&self, key: &CheckpointKey) -> Result<bool, AppError> {
        let db = self.db().await?;
        let result = sqlx::query("DELETE FROM checkpoint_queue WHERE key = ?")
            .bind(key.to_string())
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// The only in-place mutation a queue entry ever receives.
    pub async fn increment_retry(&self, key: &CheckpointKey, error: &str) -> Result<bool, AppError> {
        let db = self.db().await?;
        let result = sqlx::query(
            "UPDATE checkpoint_queue SET retry_count = retry_count + 1, last_error = ? WHERE key = ?",
        )
        .bind(error)
        .bind(key.to_string())
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Moves an entry out of the queue into the failed-checkpoint ledger.
    pub async fn fail_checkpoint(&self, key: &CheckpointKey, error: &str) -> Result<bool, AppError> {
        let db = self.db().await?;
        let mut tx = db.begin().await?;

        let moved = sqlx::query(
            r#"
            INSERT OR REPLACE INTO failed_checkpoints
                (key, attempt_id, question_id, answer, is_flagged, time_spent_seconds,
                 sequence, created_at, retry_count, last_error, failed_at)
            SELECT key, attempt_id, question_id, answer, is_flagged, time_spent_seconds,
                   sequence, created_at, retry_count, ?, ?
            FROM checkpoint_queue WHERE key = ?
            "#,
        )
        .bind(error)
        .bind(Utc::now())
        .bind(key.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM checkpoint_queue WHERE key = ?")
            .bind(key.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(moved > 0)
    }

    pub async fn list_failed(
        &self,
        attempt_id: Option<i64>,
    ) -> Result<Vec<FailedCheckpoint>, AppError> {
        let db = self.db().await?;
        let rows = sqlx::query_as::<_, FailedRow>(
            r#"
            SELECT * FROM failed_checkpoints
            WHERE (?1 IS NULL OR attempt_id = ?1)
            ORDER BY sequence ASC, failed_at ASC
            "#,
        )
        .bind(attempt_id)
        .fetch_all(db)
        .await?;

        rows.into_iter()
            .map(|row| {
                let failed_at = row.failed_at;
                let queued = QueuedCheckpoint::try_from(row.queued)?;
                Ok(FailedCheckpoint {
                    key: queued.key,
                    checkpoint: queued.checkpoint,
                    created_at: queued.created_at,
                    retry_count: queued.retry_count,
                    last_error: queued.last_error,
                    failed_at,
                })
            })
            .collect()
    }

    pub async fn clear_queue(&self, attempt_id: Option<i64>) -> Result<u64, AppError> {
        let db = self.db().await?;
        let result =
            sqlx::query("DELETE FROM checkpoint_queue WHERE (?1 IS NULL OR attempt_id = ?1)")
                .bind(attempt_id)
                .execute(db)
                .await?;
        Ok(result.rows_affected())
    }

    // ===== SYNC METADATA OPERATIONS =====

    pub async fn get_last_sync_time(&self) -> Result<Option<DateTime<Utc>>, AppError> {
        match self.get_meta(META_LAST_SYNC_TIME).await? {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| AppError::StoreUnavailable(format!("corrupt lastSyncTime: {}", e))),
            None => Ok(None),
        }
    }

    pub async fn set_last_sync_time(&self, time: DateTime<Utc>) -> Result<(), AppError> {
        self.set_meta(META_LAST_SYNC_TIME, &time.to_rfc3339()).await
    }

    pub async fn get_sync_status(&self) -> Result<SyncStatus, AppError> {
        match self.get_meta(META_SYNC_STATUS).await? {
            Some(raw) => raw.parse(),
            None => Ok(SyncStatus::Idle),
        }
    }

    pub async fn set_sync_status(&self, status: SyncStatus) -> Result<(), AppError> {
        self.set_meta(META_SYNC_STATUS, status.as_str()).await
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>, AppError> {
        let db = self.db().await?;
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM sync_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(db)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<(), AppError> {
        let db = self.db().await?;
        sqlx::query("INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(db)
            .await?;
        Ok(())
    }

    // ===== UTILITY OPERATIONS =====

    pub async fn storage_info(&self) -> Result<StorageInfo, AppError> {
        let db = self.db().await?;
        let (exams_count, attempts_count, answers_count, queued_count, failed_count): (
            i64,
            i64,
            i64,
            i64,
            i64,
        ) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM exams),
                (SELECT COUNT(*) FROM attempts),
                (SELECT COUNT(*) FROM answers),
                (SELECT COUNT(*) FROM checkpoint_queue),
                (SELECT COUNT(*) FROM failed_checkpoints)
            "#,
        )
        .fetch_one(db)
        .await?;

        Ok(StorageInfo {
            exams_count,
            attempts_count,
            answers_count,
            queued_count,
            failed_count,
        })
    }

    pub async fn clear_all(&self) -> Result<(), AppError> {
        let db = self.db().await?;
        let mut tx = db.begin().await?;
        for table in [
            "exams",
            "attempts",
            "answers",
            "checkpoint_queue",
            "failed_checkpoints",
            "sync_meta",
        ] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Closes the pool. Later operations fail with `StoreUnavailable`.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
            tracing::info!("Local store closed ({})", self.url);
        }
    }
}

fn decode_snapshot<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, AppError> {
    serde_json::from_str(raw).map_err(|e| AppError::StoreUnavailable(format!("corrupt snapshot: {}", e)))
}
