use std::io;

use offsync_core::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] offsync_core::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No payload provided")]
    EmptyPayload,
    #[error("Payload is not valid JSON: {0}")]
    InvalidPayload(String),
    #[error("Not a record id: {0}")]
    InvalidId(String),
    #[error("Record not found: {0}")]
    RecordNotFound(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "Sync is not configured. Run `offsync config set --server-url <URL>` or set OFFSYNC_SERVER_URL."
    )]
    SyncNotConfigured,
}
