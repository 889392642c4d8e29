//! Error types for the backup engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hash or MAC mismatch. Callers must never hand out data after this.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Replication to {destination} failed: {reason}")]
    Replication { destination: String, reason: String },

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Configuration(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        EngineError::Integrity(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        EngineError::Crypto(msg.into())
    }

    pub fn replication(destination: impl Into<String>, reason: impl ToString) -> Self {
        EngineError::Replication {
            destination: destination.into(),
            reason: reason.to_string(),
        }
    }

    /// True for errors that mean stored data could not be authenticated.
    pub fn is_integrity(&self) -> bool {
        matches!(self, EngineError::Integrity(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
