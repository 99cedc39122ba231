//! Wire types shared by the sync client and the authoritative server.

use serde::{Deserialize, Serialize};

use crate::models::{Operation, OutboxEntry, Record, RecordId};

/// Body of `POST /v1/sync/push`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    pub entries: Vec<PushEntry>,
}

/// One outbox entry as sent to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEntry {
    pub sequence: i64,
    pub op: Operation,
    pub entity_id: RecordId,
    pub base_version: i64,
    pub origin_id: String,
    pub idempotency_key: String,
    pub record: Record,
}

impl From<&OutboxEntry> for PushEntry {
    fn from(entry: &OutboxEntry) -> Self {
        Self {
            sequence: entry.sequence,
            op: entry.op,
            entity_id: entry.entity_id,
            base_version: entry.base_version,
            origin_id: entry.origin_id.clone(),
            idempotency_key: entry.idempotency_key.clone(),
            record: entry.payload.clone(),
        }
    }
}

/// Server verdict on a pushed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushOutcome {
    /// Applied (or recognised as an already applied replay)
    Accepted,
    /// Base version is stale; `server_record` carries the current value
    Conflict,
    /// Refused for good, e.g. an update to an unknown record
    Rejected,
}

/// Per-entry answer to a push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResult {
    /// `sequence` of the entry this result answers
    pub sequence_ref: i64,
    pub outcome: PushOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_record: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PushResult {
    pub const fn accepted(sequence_ref: i64, new_version: i64) -> Self {
        Self {
            sequence_ref,
            outcome: PushOutcome::Accepted,
            server_record: None,
            new_version: Some(new_version),
            reason: None,
        }
    }

    pub const fn conflict(sequence_ref: i64, server_record: Record) -> Self {
        Self {
            sequence_ref,
            outcome: PushOutcome::Conflict,
            server_record: Some(server_record),
            new_version: None,
            reason: None,
        }
    }

    pub fn rejected(sequence_ref: i64, reason: impl Into<String>) -> Self {
        Self {
            sequence_ref,
            outcome: PushOutcome::Rejected,
            server_record: None,
            new_version: None,
            reason: Some(reason.into()),
        }
    }
}

/// Response body of `POST /v1/sync/push`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub results: Vec<PushResult>,
}

/// Query string of `GET /v1/sync/pull`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Server changes after a watermark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    pub records: Vec<Record>,
    /// Opaque token to send as `since` on the next pull
    pub new_watermark: String,
    /// More changes are waiting past `new_watermark`
    #[serde(default)]
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_push_result_omits_empty_fields() {
        let json = serde_json::to_value(PushResult::accepted(7, 2)).unwrap();
        assert_eq!(
            json,
            json!({"sequence_ref": 7, "outcome": "accepted", "new_version": 2})
        );
    }

    #[test]
    fn test_pull_response_defaults_has_more() {
        let response: PullResponse =
            serde_json::from_str(r#"{"records": [], "new_watermark": "0"}"#).unwrap();
        assert!(!response.has_more);
    }

    #[test]
    fn test_push_entry_from_outbox_entry() {
        let record = Record::new(json!({"name": "Acme"}), "device-a", 5);
        let entry = OutboxEntry {
            sequence: 3,
            op: Operation::Create,
            entity_id: record.id,
            payload: record.clone(),
            base_version: 0,
            origin_id: "device-a".into(),
            created_at: 5,
            status: crate::models::EntryStatus::InFlight,
            retry_count: 0,
            repush_count: 0,
            idempotency_key: "key-1".into(),
            server_record: None,
            last_error: None,
        };

        let wire = PushEntry::from(&entry);
        assert_eq!(wire.sequence, 3);
        assert_eq!(wire.idempotency_key, "key-1");
        assert_eq!(wire.record, record);
    }
}
