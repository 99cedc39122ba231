//! Error types for offsync-core

use thiserror::Error;

use crate::transport::TransportError;

/// Result type alias using offsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in offsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A write tried to move a record to a lower version than the stored one.
    #[error("Stale write for {id}: stored version {stored}, attempted {attempted}")]
    StaleWrite {
        id: String,
        stored: i64,
        attempted: i64,
    },

    /// Network boundary failure; retryable.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server authoritatively refused a mutation.
    #[error("Server rejected change to {id}: {reason}")]
    PermanentRejection { id: String, reason: String },

    /// An outbox entry exhausted its retries.
    #[error("Retry ceiling exceeded for {id} after {retries} attempts")]
    RetryCeilingExceeded { id: String, retries: u32 },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The engine was shut down
    #[error("Sync engine has been shut down")]
    ShutDown,
}
