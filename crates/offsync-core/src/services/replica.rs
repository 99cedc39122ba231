//! Local replica service used by clients.
//!
//! Every write updates the record and appends its outbox entry in a single
//! transaction, so a crash can never leave one without the other.

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;

use crate::db::{
    ConflictRepository, Database, NewSyncConflict, OutboxRepository, RecordRepository,
    SqliteConflictRepository, SqliteOutbox, SqliteRecordRepository,
};
use crate::engine::{apply_server_record, derived_status};
use crate::error::{Error, Result};
use crate::models::{
    ConflictResolution, EntryStatus, NewOutboxEntry, Operation, OutboxCounts, OutboxEntry, Record,
    RecordId, SyncConflict,
};
use crate::util::{Clock, SystemClock};

/// How a user settles a flagged conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualResolution {
    /// Push the local value over the server's current version
    KeepLocal,
    /// Take the server's value and drop local changes
    KeepServer,
}

/// Business-facing API over the local store and outbox
#[derive(Clone)]
pub struct Replica {
    db: Database,
    origin_id: String,
    clock: Arc<dyn Clock>,
}

impl Replica {
    pub fn new(db: Database, origin_id: impl Into<String>) -> Self {
        Self::with_clock(db, origin_id, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(db: Database, origin_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            origin_id: origin_id.into(),
            clock,
        }
    }

    /// Open a replica stored at the given path
    pub fn open_path(path: impl AsRef<Path>, origin_id: impl Into<String>) -> Result<Self> {
        Ok(Self::new(Database::open(path)?, origin_id))
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }

    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    /// Write the record and queue its mutation
    fn record_mutation(
        conn: &Connection,
        mut record: Record,
        op: Operation,
        base_version: i64,
    ) -> Result<Record> {
        let records = SqliteRecordRepository::new(conn);
        records.upsert(&record)?;
        SqliteOutbox::new(conn).append(&NewOutboxEntry::new(
            op,
            record.clone(),
            base_version,
            record.updated_at,
        ))?;
        record.sync_status = derived_status(conn, &record.id)?;
        records.set_sync_status(&record.id, record.sync_status)?;
        Ok(record)
    }

    fn live_record(conn: &Connection, id: &RecordId) -> Result<Record> {
        let record = SqliteRecordRepository::new(conn)
            .get(id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if record.deleted {
            return Err(Error::InvalidInput(format!("record {id} is deleted")));
        }
        Ok(record)
    }

    /// Create a new record
    pub fn create(&self, payload: serde_json::Value) -> Result<Record> {
        let record = Record::new(payload, self.origin_id.clone(), self.clock.now_millis());
        let record = self
            .db
            .apply_in_transaction(|tx| Self::record_mutation(tx, record, Operation::Create, 0))?;
        tracing::debug!(id = %record.id, "Created record");
        Ok(record)
    }

    /// Replace a record's payload
    pub fn update(&self, id: &RecordId, payload: serde_json::Value) -> Result<Record> {
        let now = self.clock.now_millis();
        let record = self.db.apply_in_transaction(|tx| {
            let mut record = Self::live_record(tx, id)?;
            let base_version = record.version;
            record.payload = payload;
            record.updated_at = now;
            record.origin_id.clone_from(&self.origin_id);
            Self::record_mutation(tx, record, Operation::Update, base_version)
        })?;
        tracing::debug!(id = %record.id, "Updated record");
        Ok(record)
    }

    /// Tombstone a record
    pub fn delete(&self, id: &RecordId) -> Result<Record> {
        let now = self.clock.now_millis();
        let record = self.db.apply_in_transaction(|tx| {
            let mut record = Self::live_record(tx, id)?;
            let base_version = record.version;
            record.deleted = true;
            record.updated_at = now;
            record.origin_id.clone_from(&self.origin_id);
            Self::record_mutation(tx, record, Operation::Delete, base_version)
        })?;
        tracing::debug!(id = %record.id, "Deleted record");
        Ok(record)
    }

    /// Fetch a record by id, tombstones included
    pub fn get(&self, id: &RecordId) -> Result<Option<Record>> {
        self.db.get(id)
    }

    /// Records that are not deleted
    pub fn list_active(&self) -> Result<Vec<Record>> {
        self.db.list_active()
    }

    /// Outbox entries in sequence order
    pub fn outbox(&self, status: Option<EntryStatus>, limit: usize) -> Result<Vec<OutboxEntry>> {
        self.db
            .with_connection(|conn| SqliteOutbox::new(conn).list(status, limit))
    }

    pub fn outbox_counts(&self) -> Result<OutboxCounts> {
        self.db.with_connection(|conn| SqliteOutbox::new(conn).counts())
    }

    /// Recently logged conflicts, newest first
    pub fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.db
            .with_connection(|conn| SqliteConflictRepository::new(conn).list_conflicts(limit))
    }

    /// Settle a flagged conflict by hand
    pub fn resolve_conflict(&self, id: &RecordId, choice: ManualResolution) -> Result<Record> {
        let now = self.clock.now_millis();
        let record = self.db.apply_in_transaction(|tx| {
            let outbox = SqliteOutbox::new(tx);
            let entry = outbox
                .entries_with_status(id, EntryStatus::Conflict)?
                .into_iter()
                .next()
                .ok_or_else(|| Error::InvalidInput(format!("record {id} has no conflict")))?;
            let server = entry.server_record.clone().ok_or_else(|| {
                Error::Database(format!("conflict entry {} lost its server record", entry.sequence))
            })?;

            let resolution = match choice {
                ManualResolution::KeepLocal => {
                    outbox.requeue(entry.sequence, server.version)?;
                    outbox.rebase(id, entry.sequence, server.version)?;
                    ConflictResolution::ManualKeepLocal
                }
                ManualResolution::KeepServer => {
                    for pending in outbox.outstanding_for(id)? {
                        outbox.discard(pending.sequence)?;
                    }
                    apply_server_record(tx, &server)?;
                    ConflictResolution::ManualKeepServer
                }
            };

            SqliteConflictRepository::new(tx).log_conflict(&NewSyncConflict::between(
                &entry.payload,
                entry.base_version,
                &server,
                resolution,
                now,
            ))?;

            let records = SqliteRecordRepository::new(tx);
            records.set_sync_status(id, derived_status(tx, id)?)?;
            records
                .get(id)?
                .ok_or_else(|| Error::NotFound(id.to_string()))
        })?;

        tracing::info!(id = %id, choice = ?choice, "Resolved conflict manually");
        Ok(record)
    }

    /// Put failed entries of a record back in the queue
    pub fn retry_failed(&self, id: &RecordId) -> Result<usize> {
        self.db.apply_in_transaction(|tx| {
            let outbox = SqliteOutbox::new(tx);
            let failed = outbox.entries_with_status(id, EntryStatus::Failed)?;
            for entry in &failed {
                outbox.requeue(entry.sequence, entry.base_version)?;
            }
            if !failed.is_empty() {
                SqliteRecordRepository::new(tx).set_sync_status(id, derived_status(tx, id)?)?;
            }
            Ok(failed.len())
        })
    }

    /// Drop failed entries of a record for good
    pub fn discard_failed(&self, id: &RecordId) -> Result<usize> {
        self.db.apply_in_transaction(|tx| {
            let outbox = SqliteOutbox::new(tx);
            let failed = outbox.entries_with_status(id, EntryStatus::Failed)?;
            for entry in &failed {
                outbox.discard(entry.sequence)?;
            }
            if !failed.is_empty() {
                SqliteRecordRepository::new(tx).set_sync_status(id, derived_status(tx, id)?)?;
            }
            Ok(failed.len())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncStatus;
    use crate::util::ManualClock;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn replica() -> Replica {
        Replica::with_clock(
            Database::open_in_memory().unwrap(),
            "device-a",
            Arc::new(ManualClock::starting_at(100)),
        )
    }

    #[test]
    fn create_writes_record_and_outbox_entry() {
        let replica = replica();
        let record = replica.create(json!({"name": "Acme"})).unwrap();

        assert_eq!(record.version, 1);
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(replica.get(&record.id).unwrap(), Some(record.clone()));

        let entries = replica.outbox(None, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].op, Operation::Create);
        assert_eq!(entries[0].base_version, 0);
    }

    #[test]
    fn update_keeps_version_and_bases_on_it() {
        let replica = replica();
        let record = replica.create(json!({"qty": 1})).unwrap();
        let updated = replica.update(&record.id, json!({"qty": 2})).unwrap();

        assert_eq!(updated.version, 1);
        assert_eq!(updated.payload, json!({"qty": 2}));

        let entries = replica.outbox(None, 10).unwrap();
        assert_eq!(entries[1].op, Operation::Update);
        assert_eq!(entries[1].base_version, 1);
    }

    #[test]
    fn delete_tombstones_and_hides_record() {
        let replica = replica();
        let record = replica.create(json!({})).unwrap();
        let deleted = replica.delete(&record.id).unwrap();

        assert!(deleted.deleted);
        assert!(replica.list_active().unwrap().is_empty());
        assert!(matches!(
            replica.update(&record.id, json!({})),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn update_unknown_record_is_not_found() {
        let replica = replica();
        assert!(matches!(
            replica.update(&RecordId::new(), json!({})),
            Err(Error::NotFound(_))
        ));
        assert_eq!(replica.outbox_counts().unwrap().total(), 0);
    }

    #[test]
    fn resolve_without_conflict_is_invalid() {
        let replica = replica();
        let record = replica.create(json!({})).unwrap();
        assert!(matches!(
            replica.resolve_conflict(&record.id, ManualResolution::KeepServer),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn retry_and_discard_failed_entries() {
        let replica = replica();
        let record = replica.create(json!({})).unwrap();
        let sequence = replica.outbox(None, 1).unwrap()[0].sequence;
        replica
            .database()
            .with_connection(|conn| SqliteOutbox::new(conn).mark_rejected(sequence, "nope"))
            .unwrap();

        assert_eq!(replica.retry_failed(&record.id).unwrap(), 1);
        assert_eq!(replica.outbox_counts().unwrap().pending, 1);

        replica
            .database()
            .with_connection(|conn| SqliteOutbox::new(conn).mark_rejected(sequence, "nope"))
            .unwrap();
        assert_eq!(replica.discard_failed(&record.id).unwrap(), 1);
        assert_eq!(replica.outbox_counts().unwrap().total(), 0);
        assert_eq!(
            replica.get(&record.id).unwrap().unwrap().sync_status,
            SyncStatus::Synced
        );
    }
}
