//! Database layer for offsync

mod conflict_repository;
mod connection;
mod migrations;
mod outbox_repository;
mod record_repository;
mod sync_state_repository;

pub use conflict_repository::{ConflictRepository, NewSyncConflict, SqliteConflictRepository};
pub use connection::Database;
pub use outbox_repository::{CoalesceReport, OutboxRepository, SqliteOutbox};
pub use record_repository::{RecordRepository, SqliteRecordRepository};
pub use sync_state_repository::{SqliteSyncStateRepository, SyncStateRepository};

/// Wrap a column decoding failure so it surfaces as a `rusqlite` error
pub(crate) fn conversion_error<E>(index: usize, error: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(error))
}
