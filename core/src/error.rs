/// Error types for chat synchronization and outbound delivery
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or store unavailable. The next tick (or an explicit retry) tries again.
    #[error("Transient fetch error: {0}")]
    TransientFetch(String),

    /// Malformed outbound entry or illegal status change. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// True when retrying the same call later can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SyncError::TransientFetch(_))
    }
}

impl From<sled::Error> for SyncError {
    fn from(e: sled::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
