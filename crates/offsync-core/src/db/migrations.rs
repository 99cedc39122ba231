//! Database migrations

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension};

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate(conn, 1, V1)?;
    }
    if version < 2 {
        migrate(conn, 2, V2)?;
    }
    if version < 3 {
        migrate(conn, 3, V3)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);

    Ok(version)
}

/// Apply one migration script atomically and record its version
fn migrate(conn: &mut Connection, version: i32, script: &str) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(script)?;
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version} (latest {CURRENT_VERSION})");
    Ok(())
}

/// Version 1: records, outbox and key/value sync state
const V1: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    );

    CREATE TABLE IF NOT EXISTS records (
        id TEXT PRIMARY KEY,
        version INTEGER NOT NULL CHECK (version >= 0),
        updated_at INTEGER NOT NULL,
        origin_id TEXT NOT NULL,
        deleted INTEGER NOT NULL DEFAULT 0,
        sync_status TEXT NOT NULL DEFAULT 'synced',
        payload TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_records_updated ON records(updated_at DESC);
    CREATE INDEX IF NOT EXISTS idx_records_status ON records(sync_status);

    -- AUTOINCREMENT keeps sequences strictly increasing after deletes
    CREATE TABLE IF NOT EXISTS outbox (
        sequence INTEGER PRIMARY KEY AUTOINCREMENT,
        op TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        base_version INTEGER NOT NULL,
        origin_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        retry_count INTEGER NOT NULL DEFAULT 0,
        repush_count INTEGER NOT NULL DEFAULT 0,
        idempotency_key TEXT NOT NULL UNIQUE,
        server_record TEXT,
        last_error TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(status, sequence);
    CREATE INDEX IF NOT EXISTS idx_outbox_entity ON outbox(entity_id, sequence);

    CREATE TABLE IF NOT EXISTS sync_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

/// Version 2: conflict resolution log
const V2: &str = "
    CREATE TABLE IF NOT EXISTS sync_conflicts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_id TEXT NOT NULL,
        local_version INTEGER NOT NULL,
        server_version INTEGER NOT NULL,
        local_updated_at INTEGER NOT NULL,
        server_updated_at INTEGER NOT NULL,
        resolution TEXT NOT NULL,
        resolved_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_sync_conflicts_entity ON sync_conflicts(entity_id);
    CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved_at ON sync_conflicts(resolved_at DESC);
";

/// Version 3: server records whose merge waits on local outbox entries
const V3: &str = "
    CREATE TABLE IF NOT EXISTS deferred_pulls (
        entity_id TEXT PRIMARY KEY,
        record TEXT NOT NULL,
        received_at INTEGER NOT NULL
    );
";

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_migrations() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let mut conn = setup();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migration_v3_creates_deferred_pulls_table() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM sqlite_master
                    WHERE type = 'table' AND name = 'deferred_pulls'
                )",
                [],
                |row| row.get(0),
            )
            .unwrap();

        assert!(exists);
    }
}
