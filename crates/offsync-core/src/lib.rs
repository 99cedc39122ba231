//! offsync-core - Core library for offsync
//!
//! This crate contains the record and outbox models, the `SQLite`-backed local
//! store, the conflict resolver and the reconciliation engine shared by the
//! CLI and the reference server.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod hub;
pub mod models;
pub mod protocol;
pub mod resolver;
pub mod scheduler;
pub mod services;
pub mod state;
pub mod transport;
pub mod util;

pub use config::SyncConfig;
pub use engine::{RoundReport, SyncEngine, SyncFailure};
pub use error::{Error, Result};
pub use models::{EntryStatus, Operation, OutboxEntry, Record, RecordId, SyncStatus};
pub use services::Replica;
pub use transport::{SyncTransport, TransportError};
