// tests/common/mod.rs

#![allow(dead_code)]

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use exam_checkpoint::{
    config::{Config, EngineConfig},
    handlers::exams::insert_exam,
    models::{
        answer::{AnswerPayload, AnswerRecord},
        checkpoint::Checkpoint,
        exam::{AttemptSnapshot, AttemptStatus, ExamSnapshot},
        question::{Question, QuestionType},
    },
    routes,
    state::AppState,
    utils::jwt::sign_jwt,
};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

pub const TEST_SECRET: &str = "test_secret_for_integration_tests";
pub const TEST_ITERATIONS: u32 = 1_000;

pub struct TestApp {
    pub address: String,
    pub ws_address: String,
    pub pool: SqlitePool,
    pub config: Config,
    pub exam_id: i64,
}

impl TestApp {
    pub fn token_for(&self, student_id: i64, username: &str) -> String {
        sign_jwt(student_id, username, TEST_SECRET, 600).expect("Failed to sign token")
    }
}

/// Spawns the reference server on a random port, backed by a fresh sqlite
/// file, with one exam seeded.
pub async fn spawn_app() -> TestApp {
    let path = std::env::temp_dir().join(format!("exam-server-{}.db", uuid::Uuid::new_v4()));
    let database_url = format!("sqlite://{}", path.display());

    let options = SqliteConnectOptions::from_str(&database_url)
        .expect("Invalid sqlite url")
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .expect("Failed to open test database");

    sqlx::migrate!("./migrations/server")
        .run(&pool)
        .await
        .expect("Failed to migrate database");

    let exam_id = insert_exam(&pool, &sample_exam())
        .await
        .expect("Failed to seed exam");

    let config = Config {
        database_url,
        jwt_secret: TEST_SECRET.to_string(),
        jwt_expiration: 600,
        rust_log: "error".to_string(),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        heartbeat_interval_secs: 30,
        encryption_iterations: TEST_ITERATIONS,
    };

    let state = AppState {
        pool: pool.clone(),
        config: config.clone(),
    };
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind random port");
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        address: format!("http://127.0.0.1:{}", port),
        ws_address: format!("ws://127.0.0.1:{}", port),
        pool,
        config,
        exam_id,
    }
}

/// Ten questions; question 7 is single choice over A-D, question 2 is
/// true/false, question 3 is free text.
pub fn sample_exam() -> ExamSnapshot {
    let questions = (1..=10)
        .map(|id| {
            let (question_type, options) = match id {
                2 => (QuestionType::TrueFalse, None),
                3 => (QuestionType::ShortAnswer, None),
                _ => (
                    QuestionType::McqSingle,
                    Some(vec!["A".into(), "B".into(), "C".into(), "D".into()]),
                ),
            };
            Question {
                id,
                question_text: format!("Question {}", id),
                question_type,
                marks: 1.0,
                options,
                order_number: id as i32,
            }
        })
        .collect();

    ExamSnapshot {
        id: 0,
        exam_code: format!("EXAM-{}", uuid::Uuid::new_v4()),
        title: "Networks midterm".to_string(),
        description: String::new(),
        duration_minutes: 90,
        total_marks: 10.0,
        passing_marks: 5.0,
        questions,
    }
}

pub fn sample_attempt(attempt_id: i64, exam_id: i64) -> AttemptSnapshot {
    AttemptSnapshot {
        id: attempt_id,
        student_id: 1,
        exam_id,
        status: AttemptStatus::InProgress,
        start_time: Some(chrono::Utc::now()),
        submit_time: None,
        duration_minutes: 90,
        time_remaining_seconds: 5_400,
        workstation_id: None,
        encryption_salt: "AAAAAAAAAAAAAAAAAAAAAA==".to_string(),
    }
}

pub fn checkpoint(attempt_id: i64, question_id: i64, option: &str, sequence: i64) -> Checkpoint {
    Checkpoint {
        attempt_id,
        question_id,
        answer: Some(AnswerPayload::choice(option)),
        is_flagged: false,
        time_spent_seconds: 10 * sequence,
        sequence,
    }
}

pub fn answer_record(attempt_id: i64, question_id: i64, option: &str, sequence: i64) -> AnswerRecord {
    AnswerRecord {
        id: None,
        attempt_id,
        question_id,
        answer: Some(AnswerPayload::choice(option)),
        is_flagged: false,
        time_spent_seconds: 10 * sequence,
        sequence,
        needs_sync: true,
        last_sync_attempt: None,
    }
}

/// Engine timers shrunk for tests.
pub fn fast_engine_config(api_base_url: &str, ws_base_url: &str) -> EngineConfig {
    EngineConfig {
        api_base_url: api_base_url.to_string(),
        ws_base_url: ws_base_url.to_string(),
        local_database_url: "sqlite::memory:".to_string(),
        ack_timeout: Duration::from_secs(2),
        max_sync_retries: 3,
        sync_retry_base: Duration::from_millis(20),
        reconnect_delay: Duration::from_millis(50),
        max_reconnect_attempts: 3,
        heartbeat_timeout: Duration::from_secs(60),
        quality_poll_interval: Duration::from_secs(30),
        slow_rtt_ceiling_ms: 1_000,
        autosave_interval: Duration::from_secs(3_600),
        sync_interval: Duration::from_secs(3_600),
        violation_limit: 3,
        encryption_iterations: TEST_ITERATIONS,
    }
}

/// Polls `condition` until it holds or five seconds pass.
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
