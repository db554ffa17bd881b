// src/config.rs

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;

/// PBKDF2 iteration count for submission key derivation.
pub const ENCRYPTION_ITERATIONS: u32 = 250_000;
/// Retry ceiling for a queued checkpoint (ceiling 3 means 4 attempts in total).
pub const SYNC_MAX_RETRIES: u32 = 3;
pub const SYNC_RETRY_BASE_MS: u64 = 2_000;
pub const CHECKPOINT_ACK_TIMEOUT_MS: u64 = 5_000;
pub const WS_RECONNECT_DELAY_MS: u64 = 3_000;
pub const WS_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const WS_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const QUALITY_POLL_INTERVAL_SECS: u64 = 30;
/// Round-trip estimate above which the link is classified `slow`.
pub const SLOW_RTT_CEILING_MS: u32 = 1_000;
pub const AUTOSAVE_INTERVAL_SECS: u64 = 15;
pub const SYNC_INTERVAL_SECS: u64 = 60;
pub const VIOLATION_LIMIT: u32 = 5;

/// Reference server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub jwt_expiration: u64,
    pub rust_log: String,
    pub bind_addr: SocketAddr,
    pub heartbeat_interval_secs: u64,
    pub encryption_iterations: u32,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://exam-server.db".to_string());

        let jwt_secret = env::var("JWT_SECRET").expect("JWT_SECRET must be set");

        let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        Self {
            database_url,
            jwt_secret,
            jwt_expiration: parse_var("JWT_EXPIRATION", 14_400),
            rust_log,
            bind_addr: parse_var("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000))),
            heartbeat_interval_secs: parse_var("WS_HEARTBEAT_INTERVAL", WS_HEARTBEAT_INTERVAL_SECS),
            encryption_iterations: parse_var("ENCRYPTION_ITERATIONS", ENCRYPTION_ITERATIONS),
        }
    }
}

/// Client engine configuration: endpoints, retry policy and timers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub api_base_url: String,
    pub ws_base_url: String,
    pub local_database_url: String,
    pub ack_timeout: Duration,
    pub max_sync_retries: u32,
    pub sync_retry_base: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// No inbound frame within this window drops the link.
    pub heartbeat_timeout: Duration,
    pub quality_poll_interval: Duration,
    pub slow_rtt_ceiling_ms: u32,
    pub autosave_interval: Duration,
    /// Period of the background drain that runs even without a reconnect.
    pub sync_interval: Duration,
    pub violation_limit: u32,
    pub encryption_iterations: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:3000".to_string(),
            ws_base_url: "ws://127.0.0.1:3000".to_string(),
            local_database_url: "sqlite://exam-local.db".to_string(),
            ack_timeout: Duration::from_millis(CHECKPOINT_ACK_TIMEOUT_MS),
            max_sync_retries: SYNC_MAX_RETRIES,
            sync_retry_base: Duration::from_millis(SYNC_RETRY_BASE_MS),
            reconnect_delay: Duration::from_millis(WS_RECONNECT_DELAY_MS),
            max_reconnect_attempts: WS_MAX_RECONNECT_ATTEMPTS,
            heartbeat_timeout: Duration::from_secs(WS_HEARTBEAT_INTERVAL_SECS * 2),
            quality_poll_interval: Duration::from_secs(QUALITY_POLL_INTERVAL_SECS),
            slow_rtt_ceiling_ms: SLOW_RTT_CEILING_MS,
            autosave_interval: Duration::from_secs(AUTOSAVE_INTERVAL_SECS),
            sync_interval: Duration::from_secs(SYNC_INTERVAL_SECS),
            violation_limit: VIOLATION_LIMIT,
            encryption_iterations: ENCRYPTION_ITERATIONS,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        dotenv().ok();

        let defaults = Self::default();

        Self {
            api_base_url: env::var("EXAM_API_URL").unwrap_or(defaults.api_base_url),
            ws_base_url: env::var("EXAM_WS_URL").unwrap_or(defaults.ws_base_url),
            local_database_url: env::var("LOCAL_DATABASE_URL")
                .unwrap_or(defaults.local_database_url),
            ack_timeout: Duration::from_millis(parse_var(
                "CHECKPOINT_ACK_TIMEOUT_MS",
                CHECKPOINT_ACK_TIMEOUT_MS,
            )),
            max_sync_retries: parse_var("SYNC_MAX_RETRIES", SYNC_MAX_RETRIES),
            sync_retry_base: Duration::from_millis(parse_var(
                "SYNC_RETRY_BASE_MS",
                SYNC_RETRY_BASE_MS,
            )),
            reconnect_delay: Duration::from_millis(parse_var(
                "WS_RECONNECT_DELAY_MS",
                WS_RECONNECT_DELAY_MS,
            )),
            max_reconnect_attempts: parse_var(
                "WS_MAX_RECONNECT_ATTEMPTS",
                WS_MAX_RECONNECT_ATTEMPTS,
            ),
            heartbeat_timeout: Duration::from_secs(
                parse_var("WS_HEARTBEAT_INTERVAL", WS_HEARTBEAT_INTERVAL_SECS) * 2,
            ),
            quality_poll_interval: Duration::from_secs(parse_var(
                "QUALITY_POLL_INTERVAL_SECS",
                QUALITY_POLL_INTERVAL_SECS,
            )),
            slow_rtt_ceiling_ms: parse_var("SLOW_RTT_CEILING_MS", SLOW_RTT_CEILING_MS),
            autosave_interval: Duration::from_secs(parse_var(
                "AUTOSAVE_INTERVAL_SECS",
                AUTOSAVE_INTERVAL_SECS,
            )),
            sync_interval: Duration::from_secs(parse_var("SYNC_INTERVAL_SECS", SYNC_INTERVAL_SECS)),
            violation_limit: parse_var("VIOLATION_LIMIT", VIOLATION_LIMIT),
            encryption_iterations: parse_var("ENCRYPTION_ITERATIONS", ENCRYPTION_ITERATIONS),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring unparsable {}={:?}, using default", name, raw);
            default
        }),
        Err(_) => default,
    }
}
