//! Record model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// A unique identifier for a record, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Create a new unique record ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Local sync state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Matches what the server last acknowledged
    #[default]
    Synced,
    /// Has local changes waiting in the outbox
    Pending,
    /// Automatic resolution gave up; needs a user decision
    Conflict,
    /// Server refused the change or retries ran out
    Failed,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(Self::Synced),
            "pending" => Ok(Self::Pending),
            "conflict" => Ok(Self::Conflict),
            "failed" => Ok(Self::Failed),
            other => Err(Error::InvalidInput(format!("unknown sync status '{other}'"))),
        }
    }
}

/// A business entity instance. The payload is opaque to the sync core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Unique identifier
    pub id: RecordId,
    /// Server-assigned version; 1 on creation
    pub version: i64,
    /// Last mutation timestamp (Unix ms), tie-break only
    pub updated_at: i64,
    /// Device or actor that produced the current value
    pub origin_id: String,
    /// Soft delete flag for sync
    pub deleted: bool,
    /// Local sync state; not meaningful on the server side
    #[serde(default)]
    pub sync_status: SyncStatus,
    /// Opaque business content
    pub payload: serde_json::Value,
}

impl Record {
    /// Create a fresh local record at version 1
    #[must_use]
    pub fn new(payload: serde_json::Value, origin_id: impl Into<String>, updated_at: i64) -> Self {
        Self {
            id: RecordId::new(),
            version: 1,
            updated_at,
            origin_id: origin_id.into(),
            deleted: false,
            sync_status: SyncStatus::Pending,
            payload,
        }
    }

    /// Copy of this record carrying a different sync status
    #[must_use]
    pub fn with_status(mut self, status: SyncStatus) -> Self {
        self.sync_status = status;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_id_unique() {
        let id1 = RecordId::new();
        let id2 = RecordId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_record_id_parse() {
        let id = RecordId::new();
        let parsed: RecordId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_record_new() {
        let record = Record::new(json!({"name": "Acme"}), "device-a", 42);
        assert_eq!(record.version, 1);
        assert_eq!(record.updated_at, 42);
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert!(!record.deleted);
    }

    #[test]
    fn test_sync_status_round_trips_through_str() {
        for status in [
            SyncStatus::Synced,
            SyncStatus::Pending,
            SyncStatus::Conflict,
            SyncStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<SyncStatus>().is_err());
    }
}
