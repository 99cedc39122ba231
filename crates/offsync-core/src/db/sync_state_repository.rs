//! Sync state repository implementation
//!
//! Holds the pull watermark, the outcome of the last round, and server
//! records whose merge is waiting on local outbox entries.

use rusqlite::{params, Connection, OptionalExtension};

use super::conversion_error;
use crate::error::{Error, Result};
use crate::models::{Record, RecordId};

const WATERMARK_KEY: &str = "pull_watermark";
const LAST_ROUND_AT_KEY: &str = "last_round_at";
const LAST_ERROR_KEY: &str = "last_error";

/// Trait for sync bookkeeping storage
pub trait SyncStateRepository {
    /// Opaque token of the last server change merged, `None` before the first pull
    fn watermark(&self) -> Result<Option<String>>;

    /// Persist the token returned by the server
    fn set_watermark(&self, watermark: &str) -> Result<()>;

    /// Timestamp (Unix ms) of the last completed round
    fn last_round_at(&self) -> Result<Option<i64>>;

    /// Record that a round finished, with its error if any
    fn record_round(&self, at: i64, error: Option<&str>) -> Result<()>;

    /// Error of the last round, if it failed
    fn last_error(&self) -> Result<Option<String>>;

    /// Park a server record until local entries for it settle
    fn defer(&self, record: &Record, received_at: i64) -> Result<()>;

    /// All deferred server records
    fn deferred(&self) -> Result<Vec<Record>>;

    /// Drop a deferred record once it has been applied or superseded
    fn clear_deferred(&self, entity_id: &RecordId) -> Result<()>;
}

/// `SQLite` implementation of `SyncStateRepository`
pub struct SqliteSyncStateRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSyncStateRepository<'a> {
    /// Create a new repository with the given connection or transaction
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn get_value(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_value(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_state (key, value) VALUES (?1, ?2)",
            [key, value],
        )?;
        Ok(())
    }

    fn delete_value(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM sync_state WHERE key = ?1", [key])?;
        Ok(())
    }

    fn parse_i64(key: &str, value: &str) -> Result<i64> {
        value
            .parse()
            .map_err(|_| Error::Database(format!("corrupt sync state '{key}': {value}")))
    }
}

impl SyncStateRepository for SqliteSyncStateRepository<'_> {
    fn watermark(&self) -> Result<Option<String>> {
        self.get_value(WATERMARK_KEY)
    }

    fn set_watermark(&self, watermark: &str) -> Result<()> {
        self.set_value(WATERMARK_KEY, watermark)
    }

    fn last_round_at(&self) -> Result<Option<i64>> {
        self.get_value(LAST_ROUND_AT_KEY)?
            .map(|value| Self::parse_i64(LAST_ROUND_AT_KEY, &value))
            .transpose()
    }

    fn record_round(&self, at: i64, error: Option<&str>) -> Result<()> {
        self.set_value(LAST_ROUND_AT_KEY, &at.to_string())?;
        match error {
            Some(error) => self.set_value(LAST_ERROR_KEY, error),
            None => self.delete_value(LAST_ERROR_KEY),
        }
    }

    fn last_error(&self) -> Result<Option<String>> {
        self.get_value(LAST_ERROR_KEY)
    }

    fn defer(&self, record: &Record, received_at: i64) -> Result<()> {
        let existing = self
            .conn
            .query_row(
                "SELECT record FROM deferred_pulls WHERE entity_id = ?1",
                [record.id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        // Keep only the newest server copy per entity
        if let Some(raw) = existing {
            let parked: Record = serde_json::from_str(&raw)?;
            if parked.version >= record.version {
                return Ok(());
            }
        }

        self.conn.execute(
            "INSERT OR REPLACE INTO deferred_pulls (entity_id, record, received_at)
             VALUES (?1, ?2, ?3)",
            params![record.id.as_str(), serde_json::to_string(record)?, received_at],
        )?;
        tracing::debug!(id = %record.id, version = record.version, "Deferred server record");
        Ok(())
    }

    fn deferred(&self) -> Result<Vec<Record>> {
        let mut stmt = self
            .conn
            .prepare("SELECT record FROM deferred_pulls ORDER BY received_at, entity_id")?;
        let records = stmt
            .query_map([], |row| {
                let raw: String = row.get(0)?;
                serde_json::from_str(&raw).map_err(|error| conversion_error(0, error))
            })?
            .collect::<rusqlite::Result<Vec<Record>>>()?;
        Ok(records)
    }

    fn clear_deferred(&self, entity_id: &RecordId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM deferred_pulls WHERE entity_id = ?1",
            [entity_id.as_str()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_watermark_round_trip() {
        let db = setup();
        db.with_connection(|conn| {
            let repo = SqliteSyncStateRepository::new(conn);
            assert_eq!(repo.watermark()?, None);

            repo.set_watermark("12")?;
            assert_eq!(repo.watermark()?.as_deref(), Some("12"));
            repo.set_watermark("13")?;
            assert_eq!(repo.watermark()?.as_deref(), Some("13"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_record_round_tracks_last_error() {
        let db = setup();
        db.with_connection(|conn| {
            let repo = SqliteSyncStateRepository::new(conn);
            assert_eq!(repo.last_round_at()?, None);

            repo.record_round(100, Some("connection refused"))?;
            assert_eq!(repo.last_round_at()?, Some(100));
            assert_eq!(repo.last_error()?.as_deref(), Some("connection refused"));

            repo.record_round(200, None)?;
            assert_eq!(repo.last_round_at()?, Some(200));
            assert_eq!(repo.last_error()?, None);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_defer_keeps_newest_copy() {
        let db = setup();
        let mut record = Record::new(json!({"v": 1}), "server", 10);
        record.version = 3;

        db.with_connection(|conn| {
            let repo = SqliteSyncStateRepository::new(conn);
            repo.defer(&record, 1)?;

            let mut older = record.clone();
            older.version = 2;
            older.payload = json!({"v": 0});
            repo.defer(&older, 2)?;
            assert_eq!(repo.deferred()?, vec![record.clone()]);

            let mut newer = record.clone();
            newer.version = 4;
            repo.defer(&newer, 3)?;
            assert_eq!(repo.deferred()?, vec![newer]);

            repo.clear_deferred(&record.id)?;
            assert!(repo.deferred()?.is_empty());
            Ok(())
        })
        .unwrap();
    }
}
