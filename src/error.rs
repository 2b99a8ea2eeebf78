//! Typed error kinds shared across every component boundary.
//!
//! Application glue (the composition root, the CLI) uses `anyhow` the way
//! the rest of this codebase does; component APIs return `CoreError` so
//! callers can match on failure kind instead of parsing messages.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimit { retry_after_ms: u64 },

    #[error("auth error: {0}")]
    Auth(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: String, available: String },

    #[error("risk block: {0}")]
    RiskBlock(String),

    #[error("executor error: {0}")]
    Executor(String),

    #[error("kill switch tripped: {0}")]
    KillSwitchTripped(String),
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::Persistence(e.to_string())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            CoreError::TransientNetwork(e.to_string())
        } else {
            CoreError::Protocol(e.to_string())
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Protocol(e.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
