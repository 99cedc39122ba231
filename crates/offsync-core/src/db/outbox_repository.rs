//! Mutation outbox implementation
//!
//! The outbox is an append-only journal of local mutation intents. Entries
//! are replayed against the server in `sequence` order per entity and are
//! only deleted once the server has durably accepted them.

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::conversion_error;
use crate::error::{Error, Result};
use crate::models::{
    EntryStatus, NewOutboxEntry, Operation, OutboxCounts, OutboxEntry, Record, RecordId,
};

const ENTRY_COLUMNS: &str = "sequence, op, entity_id, payload, base_version, origin_id, \
     created_at, status, retry_count, repush_count, idempotency_key, server_record, last_error";

/// Result of compacting pending entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoalesceReport {
    /// Entries removed from the log
    pub removed: usize,
    /// Entities whose create and delete cancelled out entirely
    pub cancelled: Vec<RecordId>,
}

/// Trait for outbox storage operations
pub trait OutboxRepository {
    /// Append a new entry with the next sequence, status `pending`
    fn append(&self, entry: &NewOutboxEntry) -> Result<OutboxEntry>;

    /// Get an entry by sequence
    fn get(&self, sequence: i64) -> Result<Option<OutboxEntry>>;

    /// Claim up to `limit` pending entries and mark them `in_flight`.
    ///
    /// At most one entry per entity is returned: an entry is only eligible
    /// when no earlier entry of the same entity is still outstanding.
    fn next_batch(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Remove an entry the server durably accepted
    fn mark_synced(&self, sequence: i64) -> Result<()>;

    /// Park an entry as conflicting, keeping the server's record
    fn mark_conflict(&self, sequence: i64, server_record: &Record) -> Result<()>;

    /// Count a failed attempt; `failed` once `max_retries` is reached
    fn mark_failed(&self, sequence: i64, max_retries: u32, error: &str) -> Result<EntryStatus>;

    /// Terminal failure without retries
    fn mark_rejected(&self, sequence: i64, reason: &str) -> Result<()>;

    /// Return every `in_flight` entry to `pending`.
    ///
    /// The entry may have reached the server, so it counts as one attempt
    /// and is no longer eligible for coalescing.
    fn revert_in_flight(&self) -> Result<usize>;

    /// Move later outstanding entries of an entity onto a newer server version
    fn rebase(&self, entity_id: &RecordId, after_sequence: i64, new_base: i64) -> Result<usize>;

    /// Re-target an in-flight entry at the server's current version
    fn prepare_repush(&self, sequence: i64, new_base: i64) -> Result<()>;

    /// Outstanding (`pending`, `in_flight`, `conflict`) entries of an entity
    fn outstanding_for(&self, entity_id: &RecordId) -> Result<Vec<OutboxEntry>>;

    /// Entries of an entity in a given state
    fn entries_with_status(
        &self,
        entity_id: &RecordId,
        status: EntryStatus,
    ) -> Result<Vec<OutboxEntry>>;

    /// Put an entry back to `pending` with fresh counters
    fn requeue(&self, sequence: i64, base_version: i64) -> Result<()>;

    /// Delete an entry regardless of its state
    fn discard(&self, sequence: i64) -> Result<()>;

    /// List entries, optionally by status, in sequence order
    fn list(&self, status: Option<EntryStatus>, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Entry counts by status
    fn counts(&self) -> Result<OutboxCounts>;

    /// Fold runs of never-sent pending entries into their net effect
    fn coalesce(&self) -> Result<CoalesceReport>;
}

/// `SQLite` implementation of `OutboxRepository`
pub struct SqliteOutbox<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteOutbox<'a> {
    /// Create a new outbox over the given connection or transaction
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
        let op: String = row.get(1)?;
        let entity_id: String = row.get(2)?;
        let payload: String = row.get(3)?;
        let status: String = row.get(7)?;
        let server_record: Option<String> = row.get(11)?;
        Ok(OutboxEntry {
            sequence: row.get(0)?,
            op: op.parse().map_err(|error| conversion_error(1, error))?,
            entity_id: entity_id
                .parse()
                .map_err(|error| conversion_error(2, error))?,
            payload: serde_json::from_str(&payload).map_err(|error| conversion_error(3, error))?,
            base_version: row.get(4)?,
            origin_id: row.get(5)?,
            created_at: row.get(6)?,
            status: status.parse().map_err(|error| conversion_error(7, error))?,
            retry_count: row.get(8)?,
            repush_count: row.get(9)?,
            idempotency_key: row.get(10)?,
            server_record: server_record
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .map_err(|error| conversion_error(11, error))?,
            last_error: row.get(12)?,
        })
    }

    fn query_entries(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<OutboxEntry>> {
        let mut stmt = self.conn.prepare(sql)?;
        let entries = stmt
            .query_map(params, Self::parse_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn expect_row(rows: usize, sequence: i64) -> Result<()> {
        if rows == 0 {
            Err(Error::NotFound(format!("outbox entry {sequence}")))
        } else {
            Ok(())
        }
    }

    /// Persist the folded form of a run: first entry rewritten, rest deleted
    fn write_fold(&self, run: &[OutboxEntry], folded: &Fold) -> Result<usize> {
        match folded {
            Fold::Cancelled => {
                for entry in run {
                    self.discard(entry.sequence)?;
                }
                Ok(run.len())
            }
            Fold::Into { op, payload } => {
                let head = &run[0];
                self.conn.execute(
                    "UPDATE outbox SET op = ?1, payload = ?2 WHERE sequence = ?3",
                    params![op.as_str(), serde_json::to_string(payload)?, head.sequence],
                )?;
                for entry in &run[1..] {
                    self.discard(entry.sequence)?;
                }
                Ok(run.len() - 1)
            }
        }
    }
}

/// Net effect of a run of mutations on one entity
enum Fold {
    Into { op: Operation, payload: Record },
    Cancelled,
}

/// Fold a run of consecutive, never-sent entries of one entity.
///
/// Returns the fold and how many entries of `run` it consumed.
fn fold_run(run: &[OutboxEntry]) -> (Fold, usize) {
    let mut op = run[0].op;
    let mut payload = run[0].payload.clone();
    let mut consumed = 1;

    for entry in &run[1..] {
        match (op, entry.op) {
            (Operation::Create, Operation::Update) | (Operation::Update, Operation::Update) => {
                payload = entry.payload.clone();
            }
            (Operation::Update, Operation::Delete) => {
                op = Operation::Delete;
                payload = entry.payload.clone();
            }
            (Operation::Create, Operation::Delete) => {
                return (Fold::Cancelled, consumed + 1);
            }
            // Nothing follows a delete and nothing precedes a create
            (Operation::Delete, _) | (_, Operation::Create) => break,
        }
        consumed += 1;
    }

    (Fold::Into { op, payload }, consumed)
}

impl OutboxRepository for SqliteOutbox<'_> {
    fn append(&self, entry: &NewOutboxEntry) -> Result<OutboxEntry> {
        let idempotency_key = Uuid::now_v7().to_string();
        self.conn.execute(
            "INSERT INTO outbox (op, entity_id, payload, base_version, origin_id, created_at, status, idempotency_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
            params![
                entry.op.as_str(),
                entry.payload.id.as_str(),
                serde_json::to_string(&entry.payload)?,
                entry.base_version,
                entry.payload.origin_id,
                entry.created_at,
                idempotency_key,
            ],
        )?;
        let sequence = self.conn.last_insert_rowid();

        tracing::debug!(
            sequence,
            op = %entry.op,
            entity = %entry.payload.id,
            base_version = entry.base_version,
            "Appended outbox entry"
        );

        Ok(OutboxEntry {
            sequence,
            op: entry.op,
            entity_id: entry.payload.id,
            payload: entry.payload.clone(),
            base_version: entry.base_version,
            origin_id: entry.payload.origin_id.clone(),
            created_at: entry.created_at,
            status: EntryStatus::Pending,
            retry_count: 0,
            repush_count: 0,
            idempotency_key,
            server_record: None,
            last_error: None,
        })
    }

    fn get(&self, sequence: i64) -> Result<Option<OutboxEntry>> {
        let entry = self
            .conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM outbox WHERE sequence = ?1"),
                params![sequence],
                Self::parse_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn next_batch(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        // Single statement: selection and the in_flight mark are atomic.
        let mut entries = self.query_entries(
            &format!(
                "UPDATE outbox SET status = 'in_flight'
                 WHERE sequence IN (
                    SELECT o.sequence FROM outbox o
                    WHERE o.status = 'pending'
                      AND NOT EXISTS (
                        SELECT 1 FROM outbox p
                        WHERE p.entity_id = o.entity_id
                          AND p.sequence < o.sequence
                          AND p.status IN ('pending', 'in_flight', 'conflict')
                      )
                    ORDER BY o.sequence
                    LIMIT ?1
                 )
                 RETURNING {ENTRY_COLUMNS}"
            ),
            params![limit as i64],
        )?;
        entries.sort_by_key(|entry| entry.sequence);
        Ok(entries)
    }

    fn mark_synced(&self, sequence: i64) -> Result<()> {
        let rows = self
            .conn
            .execute("DELETE FROM outbox WHERE sequence = ?1", params![sequence])?;
        Self::expect_row(rows, sequence)
    }

    fn mark_conflict(&self, sequence: i64, server_record: &Record) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE outbox SET status = 'conflict', server_record = ?1 WHERE sequence = ?2",
            params![serde_json::to_string(server_record)?, sequence],
        )?;
        Self::expect_row(rows, sequence)
    }

    fn mark_failed(&self, sequence: i64, max_retries: u32, error: &str) -> Result<EntryStatus> {
        let status: Option<String> = self
            .conn
            .query_row(
                "UPDATE outbox SET
                    retry_count = retry_count + 1,
                    status = CASE WHEN retry_count + 1 >= ?1 THEN 'failed' ELSE 'pending' END,
                    last_error = ?2
                 WHERE sequence = ?3
                 RETURNING status",
                params![max_retries, error, sequence],
                |row| row.get(0),
            )
            .optional()?;

        let status = status.ok_or_else(|| Error::NotFound(format!("outbox entry {sequence}")))?;
        status.parse()
    }

    fn mark_rejected(&self, sequence: i64, reason: &str) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE outbox SET status = 'failed', last_error = ?1 WHERE sequence = ?2",
            params![reason, sequence],
        )?;
        Self::expect_row(rows, sequence)
    }

    fn revert_in_flight(&self) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE outbox SET status = 'pending', retry_count = retry_count + 1
             WHERE status = 'in_flight'",
            [],
        )?;
        Ok(rows)
    }

    fn rebase(&self, entity_id: &RecordId, after_sequence: i64, new_base: i64) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE outbox SET base_version = ?1
             WHERE entity_id = ?2
               AND sequence > ?3
               AND status IN ('pending', 'in_flight')
               AND base_version < ?1",
            params![new_base, entity_id.as_str(), after_sequence],
        )?;
        Ok(rows)
    }

    fn prepare_repush(&self, sequence: i64, new_base: i64) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE outbox SET base_version = ?1, repush_count = repush_count + 1
             WHERE sequence = ?2",
            params![new_base, sequence],
        )?;
        Self::expect_row(rows, sequence)
    }

    fn outstanding_for(&self, entity_id: &RecordId) -> Result<Vec<OutboxEntry>> {
        self.query_entries(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM outbox
                 WHERE entity_id = ?1 AND status IN ('pending', 'in_flight', 'conflict')
                 ORDER BY sequence"
            ),
            params![entity_id.as_str()],
        )
    }

    fn entries_with_status(
        &self,
        entity_id: &RecordId,
        status: EntryStatus,
    ) -> Result<Vec<OutboxEntry>> {
        self.query_entries(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM outbox
                 WHERE entity_id = ?1 AND status = ?2
                 ORDER BY sequence"
            ),
            params![entity_id.as_str(), status.as_str()],
        )
    }

    fn requeue(&self, sequence: i64, base_version: i64) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE outbox SET
                status = 'pending',
                base_version = ?1,
                retry_count = 0,
                repush_count = 0,
                server_record = NULL,
                last_error = NULL
             WHERE sequence = ?2",
            params![base_version, sequence],
        )?;
        Self::expect_row(rows, sequence)
    }

    fn discard(&self, sequence: i64) -> Result<()> {
        self.mark_synced(sequence)
    }

    fn list(&self, status: Option<EntryStatus>, limit: usize) -> Result<Vec<OutboxEntry>> {
        match status {
            Some(status) => self.query_entries(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM outbox WHERE status = ?1 ORDER BY sequence LIMIT ?2"
                ),
                params![status.as_str(), limit as i64],
            ),
            None => self.query_entries(
                &format!("SELECT {ENTRY_COLUMNS} FROM outbox ORDER BY sequence LIMIT ?1"),
                params![limit as i64],
            ),
        }
    }

    fn counts(&self) -> Result<OutboxCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM outbox GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = OutboxCounts::default();
        for (status, count) in rows {
            let count = usize::try_from(count).unwrap_or_default();
            match status.parse::<EntryStatus>()? {
                EntryStatus::Pending => counts.pending = count,
                EntryStatus::InFlight => counts.in_flight = count,
                EntryStatus::Conflict => counts.conflict = count,
                EntryStatus::Failed => counts.failed = count,
                EntryStatus::Synced => {}
            }
        }
        Ok(counts)
    }

    fn coalesce(&self) -> Result<CoalesceReport> {
        let pending = self.query_entries(
            &format!("SELECT {ENTRY_COLUMNS} FROM outbox WHERE status = 'pending' ORDER BY sequence"),
            [],
        )?;

        let mut by_entity: BTreeMap<RecordId, Vec<OutboxEntry>> = BTreeMap::new();
        for entry in pending {
            by_entity.entry(entry.entity_id).or_default().push(entry);
        }

        let mut report = CoalesceReport::default();
        for (entity_id, entries) in by_entity {
            // Entries the server may already know stay as they are and split runs.
            for run in entries.split(OutboxEntry::was_attempted) {
                let mut start = 0;
                while start < run.len() {
                    let (fold, consumed) = fold_run(&run[start..]);
                    let slice = &run[start..start + consumed];
                    if matches!(fold, Fold::Cancelled) {
                        report.cancelled.push(entity_id);
                    }
                    if slice.len() > 1 || matches!(fold, Fold::Cancelled) {
                        report.removed += self.write_fold(slice, &fold)?;
                    }
                    start += consumed;
                }
            }
        }

        if report.removed > 0 {
            tracing::debug!(
                removed = report.removed,
                cancelled = report.cancelled.len(),
                "Coalesced outbox"
            );
        }
        Ok(report)
    }
}
