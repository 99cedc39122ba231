//! Data models for offsync

mod conflict;
mod outbox;
mod record;

pub use conflict::{ConflictResolution, SyncConflict};
pub use outbox::{EntryStatus, NewOutboxEntry, Operation, OutboxCounts, OutboxEntry};
pub use record::{Record, RecordId, SyncStatus};
