//! Database connection management

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};

use super::migrations;
use super::record_repository::{RecordRepository, SqliteRecordRepository};
use crate::error::Result;
use crate::models::{Record, RecordId};

/// Shared handle to the local replica database.
///
/// Cloning is cheap; every clone talks to the same connection. All access is
/// synchronous and the connection lock is never held across an `.await`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        Self::init(conn, Some(path))
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, None)
    }

    fn init(mut conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        Self::configure(&conn, path.is_some())?;
        migrations::run(&mut conn)?;
        tracing::debug!(
            path = path.as_ref().map_or_else(|| ":memory:".into(), |p| p.display().to_string()),
            "Local store ready"
        );
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Configure `SQLite` for durability and concurrent readers
    fn configure(conn: &Connection, on_disk: bool) -> Result<()> {
        let journal_mode = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        });
        // In-memory databases keep their "memory" journal
        if on_disk {
            let mode = journal_mode?;
            if !mode.eq_ignore_ascii_case("wal") {
                tracing::warn!(%mode, "Local store is not running in WAL mode");
            }
        }
        conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic inside a transaction rolled it back on unwind, so the
        // connection itself is still consistent.
        self.conn.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            tracing::warn!("Recovering poisoned local store lock");
            poisoned.into_inner()
        })
    }

    /// Run read-only work against the connection
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.lock();
        f(&guard)
    }

    /// Run `f` inside an exclusive write transaction.
    ///
    /// Commits when `f` returns `Ok`; rolls back when it returns `Err` or
    /// panics.
    pub fn apply_in_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.lock();
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Get a record by ID
    pub fn get(&self, id: &RecordId) -> Result<Option<Record>> {
        self.with_connection(|conn| SqliteRecordRepository::new(conn).get(id))
    }

    /// Insert or replace a record; refuses version regressions
    pub fn upsert(&self, record: &Record) -> Result<()> {
        self.apply_in_transaction(|tx| SqliteRecordRepository::new(tx).upsert(record))
    }

    /// List records that are not tombstoned
    pub fn list_active(&self) -> Result<Vec<Record>> {
        self.with_connection(|conn| SqliteRecordRepository::new(conn).list_active())
    }

    /// Filesystem path, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::SyncStatus;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.path().is_none());
        assert!(db.list_active().unwrap().is_empty());
    }

    #[test]
    fn test_records_survive_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("replica.db");
        let record = Record::new(json!({"sku": "A-1"}), "device-a", 10);

        {
            let db = Database::open(&path).unwrap();
            db.upsert(&record).unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.get(&record.id).unwrap(), Some(record));
    }

    #[test]
    fn test_on_disk_store_uses_wal() {
        let tmp = tempdir().unwrap();
        let db = Database::open(tmp.path().join("replica.db")).unwrap();

        let mode = db
            .with_connection(|conn| {
                Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))?)
            })
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let record = Record::new(json!({}), "device-a", 10);

        let result: Result<()> = db.apply_in_transaction(|tx| {
            SqliteRecordRepository::new(tx).upsert(&record)?;
            Err(Error::InvalidInput("abort".into()))
        });

        assert!(result.is_err());
        assert_eq!(db.get(&record.id).unwrap(), None);
    }

    #[test]
    fn test_transaction_rolls_back_on_panic() {
        let db = Database::open_in_memory().unwrap();
        let record = Record::new(json!({}), "device-a", 10);

        let db_clone = db.clone();
        let record_clone = record.clone();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _: Result<()> = db_clone.apply_in_transaction(|tx| {
                SqliteRecordRepository::new(tx).upsert(&record_clone)?;
                panic!("writer crashed")
            });
        }));

        assert!(outcome.is_err());
        assert_eq!(db.get(&record.id).unwrap(), None);
        // The store stays usable after the poisoned lock
        db.upsert(&record.clone().with_status(SyncStatus::Synced))
            .unwrap();
    }
}
