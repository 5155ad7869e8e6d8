//! Error taxonomy for the herd engine.
//!
//! Transient external failures get retried, protocol errors are dropped at
//! the boundary, policy outcomes are not errors at all (see
//! [`crate::herd::Outcome`]), and conflicts (duplicate zap ids) resolve
//! silently. `Fatal` is reserved for conditions that should abort startup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HerdError {
    #[error("transient external failure: {0}")]
    Transient(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl HerdError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        HerdError::Protocol(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        HerdError::Transient(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, HerdError::Transient(_))
    }
}

impl From<reqwest::Error> for HerdError {
    fn from(e: reqwest::Error) -> Self {
        HerdError::Transient(e.to_string())
    }
}

impl From<rusqlite::Error> for HerdError {
    fn from(e: rusqlite::Error) -> Self {
        HerdError::Transient(e.to_string())
    }
}

impl From<serde_json::Error> for HerdError {
    fn from(e: serde_json::Error) -> Self {
        HerdError::Protocol(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for HerdError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        HerdError::Transient(e.to_string())
    }
}

pub type HerdResult<T> = Result<T, HerdError>;
