//! Outbox entry model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

use super::record::{Record, RecordId};

/// Kind of local mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("unknown operation '{other}'"))),
        }
    }
}

/// Lifecycle state of an outbox entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    InFlight,
    Synced,
    Conflict,
    Failed,
}

impl EntryStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
            Self::Failed => "failed",
        }
    }

    /// Entries in these states still hold back later entries of the same entity
    pub const fn is_outstanding(self) -> bool {
        matches!(self, Self::Pending | Self::InFlight | Self::Conflict)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "synced" => Ok(Self::Synced),
            "conflict" => Ok(Self::Conflict),
            "failed" => Ok(Self::Failed),
            other => Err(Error::InvalidInput(format!("unknown entry status '{other}'"))),
        }
    }
}

/// Mutation intent waiting to be confirmed by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Local replay order
    pub sequence: i64,
    pub op: Operation,
    pub entity_id: RecordId,
    /// Record snapshot at mutation time
    pub payload: Record,
    /// Server version the client believed current (0 for creates)
    pub base_version: i64,
    pub origin_id: String,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    pub status: EntryStatus,
    /// Transport failures so far
    pub retry_count: u32,
    /// Conflict re-pushes so far
    pub repush_count: u32,
    /// Sent with every push so the server can recognise replays
    pub idempotency_key: String,
    /// Server's copy, attached when the entry is flagged as a conflict
    pub server_record: Option<Record>,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    /// Whether the server may already have seen this entry's idempotency key
    pub const fn was_attempted(&self) -> bool {
        self.retry_count > 0 || self.repush_count > 0
    }
}

/// Input to `Outbox::append`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxEntry {
    pub op: Operation,
    pub payload: Record,
    pub base_version: i64,
    pub created_at: i64,
}

impl NewOutboxEntry {
    pub const fn new(op: Operation, payload: Record, base_version: i64, created_at: i64) -> Self {
        Self {
            op,
            payload,
            base_version,
            created_at,
        }
    }
}

/// Entry counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub conflict: usize,
    pub failed: usize,
}

impl OutboxCounts {
    pub const fn total(&self) -> usize {
        self.pending + self.in_flight + self.conflict + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_status_parse() {
        assert_eq!(
            "in_flight".parse::<EntryStatus>().unwrap(),
            EntryStatus::InFlight
        );
        assert!("inflight".parse::<EntryStatus>().is_err());
    }

    #[test]
    fn test_outstanding_statuses() {
        assert!(EntryStatus::Pending.is_outstanding());
        assert!(EntryStatus::InFlight.is_outstanding());
        assert!(EntryStatus::Conflict.is_outstanding());
        assert!(!EntryStatus::Failed.is_outstanding());
        assert!(!EntryStatus::Synced.is_outstanding());
    }

    #[test]
    fn test_operation_serializes_lowercase() {
        let json = serde_json::to_string(&Operation::Delete).unwrap();
        assert_eq!(json, "\"delete\"");
    }
}
