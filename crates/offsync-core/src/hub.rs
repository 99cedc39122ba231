//! Authoritative replica.
//!
//! The hub is the single source of truth every device reconciles against. It
//! assigns versions under optimistic concurrency, recognises replayed pushes
//! and hands out changes after an opaque watermark. State is kept in memory;
//! `offsync-server` exposes it over HTTP and `LoopbackTransport` in-process.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::models::{Operation, Record, RecordId, SyncStatus};
use crate::protocol::{PullResponse, PushEntry, PushResult};

/// Requests the hub cannot interpret at all
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("Invalid watermark: {0}")]
    InvalidWatermark(String),
    #[error("Pull limit must be at least 1")]
    InvalidLimit,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    record: Record,
    change_seq: u64,
}

/// What an accepted mutation produced, for replay detection
#[derive(Debug, Clone)]
struct AppliedMutation {
    origin_id: String,
    deleted: bool,
    payload: serde_json::Value,
    version: i64,
}

#[derive(Debug, Default)]
struct HubState {
    records: HashMap<RecordId, StoredRecord>,
    change_seq: u64,
    by_key: HashMap<String, i64>,
    by_base: HashMap<(RecordId, i64), AppliedMutation>,
}

/// In-memory authoritative replica
#[derive(Debug, Default)]
pub struct Hub {
    state: Mutex<HubState>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply pushed entries in order and answer each one
    pub fn push(&self, entries: &[PushEntry]) -> Vec<PushResult> {
        let mut state = self.lock();
        entries
            .iter()
            .map(|entry| state.apply(entry))
            .collect()
    }

    /// Records changed after `since`, oldest change first
    pub fn pull(&self, since: Option<&str>, limit: usize) -> Result<PullResponse, HubError> {
        if limit == 0 {
            return Err(HubError::InvalidLimit);
        }
        let since = match since {
            None => 0,
            Some(raw) if raw.trim().is_empty() => 0,
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map_err(|_| HubError::InvalidWatermark(raw.to_string()))?,
        };

        let state = self.lock();
        let mut changed: Vec<&StoredRecord> = state
            .records
            .values()
            .filter(|stored| stored.change_seq > since)
            .collect();
        changed.sort_by_key(|stored| stored.change_seq);

        let has_more = changed.len() > limit;
        changed.truncate(limit);
        let new_watermark = changed.last().map_or(since, |stored| stored.change_seq);

        Ok(PullResponse {
            records: changed.into_iter().map(|stored| stored.record.clone()).collect(),
            new_watermark: new_watermark.to_string(),
            has_more,
        })
    }

    /// Current server copy of a record
    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.lock().records.get(id).map(|stored| stored.record.clone())
    }

    /// Write a record as-is, bypassing concurrency checks.
    ///
    /// Stands in for administrative or out-of-band writes.
    pub fn seed(&self, record: Record) {
        let mut state = self.lock();
        state.store(record.with_status(SyncStatus::Synced));
    }

    /// Number of records, tombstones included
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HubState {
    fn store(&mut self, record: Record) {
        self.change_seq += 1;
        self.records.insert(
            record.id,
            StoredRecord {
                record,
                change_seq: self.change_seq,
            },
        );
    }

    fn is_replay(&self, entry: &PushEntry) -> Option<i64> {
        if let Some(version) = self.by_key.get(&entry.idempotency_key) {
            return Some(*version);
        }
        // Clients that lost the key still match on what they sent
        self.by_base
            .get(&(entry.entity_id, entry.base_version))
            .filter(|applied| {
                applied.origin_id == entry.origin_id
                    && applied.deleted == is_tombstone(entry)
                    && applied.payload == entry.record.payload
            })
            .map(|applied| applied.version)
    }

    fn apply(&mut self, entry: &PushEntry) -> PushResult {
        if entry.record.id != entry.entity_id {
            return PushResult::rejected(entry.sequence, "entity_id does not match record id");
        }

        if let Some(version) = self.is_replay(entry) {
            tracing::debug!(
                id = %entry.entity_id,
                key = %entry.idempotency_key,
                version,
                "Recognised replayed push"
            );
            return PushResult::accepted(entry.sequence, version);
        }

        let current = self.records.get(&entry.entity_id).map(|stored| &stored.record);
        match (entry.op, current) {
            (Operation::Update | Operation::Delete, None) => {
                return PushResult::rejected(
                    entry.sequence,
                    format!("record {} does not exist", entry.entity_id),
                );
            }
            (Operation::Create, Some(current)) => {
                return PushResult::conflict(entry.sequence, current.clone());
            }
            (_, Some(current)) if current.version != entry.base_version => {
                return PushResult::conflict(entry.sequence, current.clone());
            }
            (Operation::Create, None) if entry.base_version != 0 => {
                return PushResult::rejected(entry.sequence, "create must have base version 0");
            }
            _ => {}
        }

        let version = entry.base_version + 1;
        let record = Record {
            id: entry.entity_id,
            version,
            updated_at: entry.record.updated_at,
            origin_id: entry.origin_id.clone(),
            deleted: is_tombstone(entry),
            sync_status: SyncStatus::Synced,
            payload: entry.record.payload.clone(),
        };

        self.by_key.insert(entry.idempotency_key.clone(), version);
        self.by_base.insert(
            (entry.entity_id, entry.base_version),
            AppliedMutation {
                origin_id: entry.origin_id.clone(),
                deleted: record.deleted,
                payload: record.payload.clone(),
                version,
            },
        );
        self.store(record);

        tracing::debug!(id = %entry.entity_id, op = %entry.op, version, "Applied push");
        PushResult::accepted(entry.sequence, version)
    }
}

fn is_tombstone(entry: &PushEntry) -> bool {
    entry.op == Operation::Delete || entry.record.deleted
}
