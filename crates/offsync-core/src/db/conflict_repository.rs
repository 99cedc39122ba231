//! Conflict log repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::{params, Connection};

use super::conversion_error;
use crate::error::Result;
use crate::models::{ConflictResolution, Record, RecordId, SyncConflict};

/// A conflict about to be written to the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSyncConflict {
    pub entity_id: RecordId,
    pub local_version: i64,
    pub server_version: i64,
    pub local_updated_at: i64,
    pub server_updated_at: i64,
    pub resolution: ConflictResolution,
    pub resolved_at: i64,
}

impl NewSyncConflict {
    /// Describe a conflict between a local snapshot pushed against
    /// `base_version` and the server's current record.
    pub fn between(
        local: &Record,
        base_version: i64,
        server: &Record,
        resolution: ConflictResolution,
        resolved_at: i64,
    ) -> Self {
        Self {
            entity_id: local.id,
            local_version: base_version,
            server_version: server.version,
            local_updated_at: local.updated_at,
            server_updated_at: server.updated_at,
            resolution,
            resolved_at,
        }
    }
}

/// Trait for conflict log storage
pub trait ConflictRepository {
    /// Append a resolved or escalated conflict to the log
    fn log_conflict(&self, conflict: &NewSyncConflict) -> Result<i64>;

    /// Most recent conflicts first
    fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>>;

    /// Conflicts recorded for one entity, oldest first
    fn conflicts_for(&self, entity_id: &RecordId) -> Result<Vec<SyncConflict>>;
}

/// `SQLite` implementation of `ConflictRepository`
pub struct SqliteConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteConflictRepository<'a> {
    /// Create a new repository with the given connection or transaction
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_conflict(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncConflict> {
        let resolution: String = row.get(6)?;
        Ok(SyncConflict {
            id: row.get(0)?,
            entity_id: row.get(1)?,
            local_version: row.get(2)?,
            server_version: row.get(3)?,
            local_updated_at: row.get(4)?,
            server_updated_at: row.get(5)?,
            resolution: resolution
                .parse()
                .map_err(|error| conversion_error(6, error))?,
            resolved_at: row.get(7)?,
        })
    }
}

impl ConflictRepository for SqliteConflictRepository<'_> {
    fn log_conflict(&self, conflict: &NewSyncConflict) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO sync_conflicts (
                entity_id, local_version, server_version, local_updated_at,
                server_updated_at, resolution, resolved_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conflict.entity_id.as_str(),
                conflict.local_version,
                conflict.server_version,
                conflict.local_updated_at,
                conflict.server_updated_at,
                conflict.resolution.as_str(),
                conflict.resolved_at,
            ],
        )?;

        tracing::info!(
            id = %conflict.entity_id,
            local_version = conflict.local_version,
            server_version = conflict.server_version,
            resolution = %conflict.resolution,
            "Recorded sync conflict"
        );
        Ok(self.conn.last_insert_rowid())
    }

    fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity_id, local_version, server_version, local_updated_at,
                    server_updated_at, resolution, resolved_at
             FROM sync_conflicts
             ORDER BY resolved_at DESC, id DESC
             LIMIT ?1",
        )?;
        let conflicts = stmt
            .query_map(params![limit as i64], Self::parse_conflict)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }

    fn conflicts_for(&self, entity_id: &RecordId) -> Result<Vec<SyncConflict>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity_id, local_version, server_version, local_updated_at,
                    server_updated_at, resolution, resolved_at
             FROM sync_conflicts
             WHERE entity_id = ?1
             ORDER BY id",
        )?;
        let conflicts = stmt
            .query_map(params![entity_id.as_str()], Self::parse_conflict)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_log_and_list_conflicts() {
        let db = Database::open_in_memory().unwrap();
        let local = Record::new(json!({"qty": 5}), "device-a", 100);
        let mut server = local.clone();
        server.version = 4;
        server.updated_at = 150;

        db.with_connection(|conn| {
            let repo = SqliteConflictRepository::new(conn);
            repo.log_conflict(&NewSyncConflict::between(
                &local,
                3,
                &server,
                ConflictResolution::ServerWins,
                200,
            ))?;
            repo.log_conflict(&NewSyncConflict::between(
                &local,
                4,
                &server,
                ConflictResolution::Flagged,
                300,
            ))?;

            let recent = repo.list_conflicts(10)?;
            assert_eq!(recent.len(), 2);
            assert_eq!(recent[0].resolution, ConflictResolution::Flagged);
            assert_eq!(recent[1].local_version, 3);
            assert_eq!(recent[1].server_updated_at, 150);

            assert_eq!(repo.list_conflicts(1)?.len(), 1);
            assert_eq!(repo.conflicts_for(&local.id)?.len(), 2);
            assert!(repo.conflicts_for(&RecordId::new())?.is_empty());
            Ok(())
        })
        .unwrap();
    }
}
