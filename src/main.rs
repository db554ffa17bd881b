// src/main.rs

use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;
use exam_checkpoint::config::Config;
use exam_checkpoint::handlers::exams::insert_exam;
use exam_checkpoint::models::exam::ExamSnapshot;
use exam_checkpoint::models::question::{Question, QuestionType};
use exam_checkpoint::routes;
use exam_checkpoint::state::AppState;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Load .env file (if present)
    dotenv().ok();

    // Load configuration from environment
    let config = Config::from_env();

    let file_appender = tracing_appender::rolling::daily("logs", "server.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::new(&config.rust_log);
    let stdout_layer = fmt::layer().with_writer(std::io::stdout).with_target(false);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    // Initialize Tracing (Logging)
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    let options = SqliteConnectOptions::from_str(&config.database_url)
        .expect("DATABASE_URL must be a valid sqlite URL")
        .create_if_missing(true)
        .foreign_keys(true);

    // Initialize Database Pool with Retry
    let mut retry_count = 0;
    let pool = loop {
        match SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(3))
            .connect_with(options.clone())
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retry_count += 1;
                if retry_count > 5 {
                    panic!("Failed to open database after 5 retries: {}", e);
                }
                tracing::warn!("Database not ready, retrying in 2s... (Attempt {})", retry_count);
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    };

    tracing::info!("Database connected...");

    // Run Migrations Automatically
    tracing::info!("Running migrations...");
    sqlx::migrate!("./migrations/server")
        .run(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Migrations applied successfully.");

    if let Err(e) = seed_demo_exam(&pool).await {
        tracing::error!("Failed to seed demo exam: {}", e);
    }

    let addr = config.bind_addr;
    let state = AppState { pool, config };

    // Create the Axum application router
    let app = routes::create_router(state);

    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();

    // Start the server
    axum::serve(listener, app).await.unwrap();
}

/// Inserts a small sample paper on first start so clients have something
/// to open.
async fn seed_demo_exam(pool: &SqlitePool) -> Result<(), Box<dyn std::error::Error>> {
    let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM exams WHERE exam_code = ?")
        .bind("DEMO-101")
        .fetch_one(pool)
        .await?;
    if exists > 0 {
        return Ok(());
    }

    let question = |id: i64, text: &str, question_type: QuestionType, options: Option<&[&str]>| {
        Question {
            id,
            question_text: text.to_string(),
            question_type,
            marks: 1.0,
            options: options.map(|o| o.iter().map(|s| s.to_string()).collect()),
            order_number: id as i32,
        }
    };

    let exam = ExamSnapshot {
        id: 0,
        exam_code: "DEMO-101".to_string(),
        title: "Demonstration Exam".to_string(),
        description: "Sample paper seeded on first start".to_string(),
        duration_minutes: 60,
        total_marks: 3.0,
        passing_marks: 2.0,
        questions: vec![
            question(
                1,
                "Which layer of the OSI model routes packets?",
                QuestionType::McqSingle,
                Some(&["Physical", "Data link", "Network", "Transport"]),
            ),
            question(
                2,
                "TCP guarantees in-order delivery.",
                QuestionType::TrueFalse,
                None,
            ),
            question(
                3,
                "Explain what an idempotent request is.",
                QuestionType::ShortAnswer,
                None,
            ),
        ],
    };

    let id = insert_exam(pool, &exam).await?;
    tracing::info!("Seeded demo exam {} ({})", exam.exam_code, id);
    Ok(())
}
