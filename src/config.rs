use crate::error::{AppError, Result};

pub const EXECUTOR_URL: &str = "http://127.0.0.1:9090/pricing/start";

/// A run left in `running` longer than this without a completion callback is
/// treated as stuck and forced to failed on the next dispatcher pass.
pub const STUCK_RUN_TIMEOUT_MS: i64 = 180_000;

/// A run is eligible for dispatch only while retry_count is below this bound.
/// Once reached it is permanently excluded — surfaced only via /health.
pub const MAX_DISPATCH_ATTEMPTS: i64 = 3;

/// Default dispatch loop interval (seconds).
pub const DISPATCH_INTERVAL_SECS: u64 = 60;

/// Timeout for the executor invocation request itself — not for the pricing
/// work, which completes out of band via the callback endpoint.
pub const EXECUTOR_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default page size for the run listing endpoint.
pub const RUN_LIST_DEFAULT_LIMIT: i64 = 50;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Endpoint the external pricing executor is started through (EXECUTOR_URL)
    pub executor_url: String,
    /// Seconds between automatic dispatch passes (DISPATCH_INTERVAL_SECS)
    pub dispatch_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "orchestrator.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            executor_url: std::env::var("EXECUTOR_URL")
                .unwrap_or_else(|_| EXECUTOR_URL.to_string()),
            dispatch_interval_secs: std::env::var("DISPATCH_INTERVAL_SECS")
                .unwrap_or_else(|_| DISPATCH_INTERVAL_SECS.to_string())
                .parse::<u64>()
                .unwrap_or(DISPATCH_INTERVAL_SECS),
        })
    }
}
