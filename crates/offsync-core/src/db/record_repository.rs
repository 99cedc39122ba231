//! Record repository implementation

use rusqlite::{params, Connection, OptionalExtension};

use super::conversion_error;
use crate::error::{Error, Result};
use crate::models::{Record, RecordId, SyncStatus};

const RECORD_COLUMNS: &str = "id, version, updated_at, origin_id, deleted, sync_status, payload";

/// Trait for local record storage operations
pub trait RecordRepository {
    /// Get a record by ID, tombstones included
    fn get(&self, id: &RecordId) -> Result<Option<Record>>;

    /// Insert or overwrite a record by ID.
    ///
    /// Fails with `Error::StaleWrite` when the stored version is higher.
    fn upsert(&self, record: &Record) -> Result<()>;

    /// List records that are not deleted, most recently updated first
    fn list_active(&self) -> Result<Vec<Record>>;

    /// List every record, tombstones included
    fn list_all(&self) -> Result<Vec<Record>>;

    /// List records in a given sync state
    fn list_by_status(&self, status: SyncStatus) -> Result<Vec<Record>>;

    /// Change only the sync status of a record
    fn set_sync_status(&self, id: &RecordId, status: SyncStatus) -> Result<()>;
}

/// `SQLite` implementation of `RecordRepository`
pub struct SqliteRecordRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteRecordRepository<'a> {
    /// Create a new repository with the given connection or transaction
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a record from a database row
    pub(crate) fn parse_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
        let id: String = row.get(0)?;
        let status: String = row.get(5)?;
        let payload: String = row.get(6)?;
        Ok(Record {
            id: id.parse().map_err(|error| conversion_error(0, error))?,
            version: row.get(1)?,
            updated_at: row.get(2)?,
            origin_id: row.get(3)?,
            deleted: row.get::<_, i32>(4)? != 0,
            sync_status: status.parse().map_err(|error| conversion_error(5, error))?,
            payload: serde_json::from_str(&payload).map_err(|error| conversion_error(6, error))?,
        })
    }

    fn query_records(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare(sql)?;
        let records = stmt
            .query_map(params, Self::parse_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}

impl RecordRepository for SqliteRecordRepository<'_> {
    fn get(&self, id: &RecordId) -> Result<Option<Record>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1"),
                params![id.as_str()],
                Self::parse_record,
            )
            .optional()?;
        Ok(record)
    }

    fn upsert(&self, record: &Record) -> Result<()> {
        let stored: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM records WHERE id = ?1",
                params![record.id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(stored) = stored {
            if record.version < stored {
                tracing::error!(
                    id = %record.id,
                    stored,
                    attempted = record.version,
                    "Refusing version regression"
                );
                return Err(Error::StaleWrite {
                    id: record.id.to_string(),
                    stored,
                    attempted: record.version,
                });
            }
        }

        self.conn.execute(
            "INSERT INTO records (id, version, updated_at, origin_id, deleted, sync_status, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                version = excluded.version,
                updated_at = excluded.updated_at,
                origin_id = excluded.origin_id,
                deleted = excluded.deleted,
                sync_status = excluded.sync_status,
                payload = excluded.payload",
            params![
                record.id.as_str(),
                record.version,
                record.updated_at,
                record.origin_id,
                i32::from(record.deleted),
                record.sync_status.as_str(),
                serde_json::to_string(&record.payload)?,
            ],
        )?;

        Ok(())
    }

    fn list_active(&self) -> Result<Vec<Record>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM records WHERE deleted = 0 ORDER BY updated_at DESC"
            ),
            [],
        )
    }

    fn list_all(&self) -> Result<Vec<Record>> {
        self.query_records(
            &format!("SELECT {RECORD_COLUMNS} FROM records ORDER BY updated_at DESC"),
            [],
        )
    }

    fn list_by_status(&self, status: SyncStatus) -> Result<Vec<Record>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM records WHERE sync_status = ?1 ORDER BY updated_at DESC"
            ),
            params![status.as_str()],
        )
    }

    fn set_sync_status(&self, id: &RecordId, status: SyncStatus) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE records SET sync_status = ?1 WHERE id = ?2",
            params![status.as_str(), id.as_str()],
        )?;

        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }

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
    fn test_upsert_and_get() {
        let db = setup();
        let record = Record::new(json!({"name": "Acme Supplies"}), "device-a", 100);

        db.with_connection(|conn| {
            let repo = SqliteRecordRepository::new(conn);
            repo.upsert(&record)?;
            assert_eq!(repo.get(&record.id)?, Some(record.clone()));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_upsert_overwrites_same_or_higher_version() {
        let db = setup();
        let mut record = Record::new(json!({"qty": 1}), "device-a", 100);

        db.with_connection(|conn| {
            let repo = SqliteRecordRepository::new(conn);
            repo.upsert(&record)?;

            record.payload = json!({"qty": 2});
            repo.upsert(&record)?;

            record.version = 5;
            repo.upsert(&record)?;

            let stored = repo.get(&record.id)?.unwrap();
            assert_eq!(stored.version, 5);
            assert_eq!(stored.payload, json!({"qty": 2}));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_upsert_rejects_version_regression() {
        let db = setup();
        let mut record = Record::new(json!({}), "device-a", 100);
        record.version = 4;

        db.with_connection(|conn| {
            let repo = SqliteRecordRepository::new(conn);
            repo.upsert(&record)?;

            let mut older = record.clone();
            older.version = 3;
            older.payload = json!({"stale": true});
            let err = repo.upsert(&older).unwrap_err();
            assert!(matches!(
                err,
                Error::StaleWrite {
                    stored: 4,
                    attempted: 3,
                    ..
                }
            ));

            assert_eq!(repo.get(&record.id)?.unwrap().payload, json!({}));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_list_active_excludes_tombstones() {
        let db = setup();
        let live = Record::new(json!({"n": 1}), "device-a", 100);
        let mut dead = Record::new(json!({"n": 2}), "device-a", 200);
        dead.deleted = true;

        db.with_connection(|conn| {
            let repo = SqliteRecordRepository::new(conn);
            repo.upsert(&live)?;
            repo.upsert(&dead)?;

            let active = repo.list_active()?;
            assert_eq!(active.len(), 1);
            assert_eq!(active[0].id, live.id);
            assert_eq!(repo.list_all()?.len(), 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_set_sync_status() {
        let db = setup();
        let record = Record::new(json!({}), "device-a", 100);

        db.with_connection(|conn| {
            let repo = SqliteRecordRepository::new(conn);
            repo.upsert(&record)?;
            repo.set_sync_status(&record.id, SyncStatus::Conflict)?;

            let conflicted = repo.list_by_status(SyncStatus::Conflict)?;
            assert_eq!(conflicted.len(), 1);

            let missing = repo.set_sync_status(&RecordId::new(), SyncStatus::Synced);
            assert!(matches!(missing, Err(Error::NotFound(_))));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_string_payload_round_trips() {
        let db = setup();
        let record = Record::new(json!("plain text"), "device-a", 100);

        db.upsert(&record).unwrap();
        assert_eq!(db.get(&record.id).unwrap().unwrap().payload, json!("plain text"));
    }
}
