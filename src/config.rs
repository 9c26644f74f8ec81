//! Process configuration from environment variables.
//!
//! All knobs are read once at boot into a plain [`Config`] value; modules
//! receive the fields they need rather than re-reading the environment.
//! Parse failures are fatal initialization errors (the daemon exits 1).

use std::time::Duration;

use thiserror::Error;

// ─── Defaults ────────────────────────────────────────────────────────────────

/// Default number of concurrent worker slots.
pub const DEFAULT_WORKER_CONCURRENCY: usize = 5;

/// Default grace period for in-flight handlers during shutdown.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 10_000;

// ─── ConfigError ─────────────────────────────────────────────────────────────

/// Errors raised while parsing environment configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },

    #[error("missing required variable {0}")]
    Missing(&'static str),
}

// ─── Config ──────────────────────────────────────────────────────────────────

/// Parsed process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of job handlers running at once.
    pub worker_concurrency: usize,
    /// How long in-flight handlers may run after shutdown is requested.
    pub shutdown_grace: Duration,
    /// Master key for the credential service (opaque to the core).
    pub credential_master_key: Option<String>,
    /// Telegram bot token, if the Telegram adapter is configured.
    pub telegram_bot_token: Option<String>,
    /// Telegram user ids allowed to talk to the bot.
    pub telegram_allowed_users: Vec<i64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            credential_master_key: None,
            telegram_bot_token: None,
            telegram_allowed_users: Vec::new(),
        }
    }
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let worker_concurrency = match std::env::var("WORKER_CONCURRENCY") {
            Ok(raw) => parse_positive_usize("WORKER_CONCURRENCY", &raw)?,
            Err(_) => DEFAULT_WORKER_CONCURRENCY,
        };

        let shutdown_grace = match std::env::var("SHUTDOWN_GRACE_MS") {
            Ok(raw) => Duration::from_millis(parse_u64("SHUTDOWN_GRACE_MS", &raw)?),
            Err(_) => Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        };

        let telegram_allowed_users = match std::env::var("TELEGRAM_ALLOWED_USERS") {
            Ok(raw) => parse_allowed_users(&raw)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            worker_concurrency,
            shutdown_grace,
            credential_master_key: std::env::var("CREDENTIAL_MASTER_KEY").ok(),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_allowed_users,
        })
    }
}

// ─── Parsing helpers ─────────────────────────────────────────────────────────

fn parse_u64(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
        var,
        value: raw.to_string(),
    })
}

fn parse_positive_usize(var: &'static str, raw: &str) -> Result<usize, ConfigError> {
    let n = raw.trim().parse::<usize>().map_err(|_| ConfigError::InvalidValue {
        var,
        value: raw.to_string(),
    })?;
    if n == 0 {
        return Err(ConfigError::InvalidValue {
            var,
            value: raw.to_string(),
        });
    }
    Ok(n)
}

/// Parse the comma-separated allow-list of Telegram user ids.
///
/// Whitespace around each segment is trimmed and empty segments are ignored.
/// Any segment that is not a positive integer fails the whole parse.
pub fn parse_allowed_users(raw: &str) -> Result<Vec<i64>, ConfigError> {
    let mut users = Vec::new();
    for segment in raw.split(',') {
        let trimmed = segment.trim();
        if trimmed.is_empty() {
            continue;
        }
        let id = trimmed
            .parse::<i64>()
            .map_err(|_| ConfigError::InvalidValue {
                var: "TELEGRAM_ALLOWED_USERS",
                value: trimmed.to_string(),
            })?;
        if id <= 0 {
            return Err(ConfigError::InvalidValue {
                var: "TELEGRAM_ALLOWED_USERS",
                value: trimmed.to_string(),
            });
        }
        users.push(id);
    }
    Ok(users)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
