//! Restarting a replica whose process died in the middle of a push.

use std::path::Path;
use std::sync::Arc;

use offsync_core::db::{Database, OutboxRepository, SqliteOutbox};
use offsync_core::hub::Hub;
use offsync_core::protocol::PushEntry;
use offsync_core::transport::LoopbackTransport;
use offsync_core::{EntryStatus, OutboxEntry, Replica, SyncConfig, SyncEngine, SyncStatus};
use pretty_assertions::assert_eq;
use serde_json::json;

/// Claim the next batch the way a round does, then "crash"
fn claim(db: &Database) -> Vec<OutboxEntry> {
    db.apply_in_transaction(|tx| SqliteOutbox::new(tx).next_batch(10))
        .unwrap()
}

fn restart(path: &Path, hub: &Arc<Hub>) -> SyncEngine<LoopbackTransport> {
    SyncEngine::init(
        Database::open(path).unwrap(),
        LoopbackTransport::new(Arc::clone(hub)),
        SyncConfig::default().with_origin("device-a"),
    )
    .unwrap()
}

#[tokio::test]
async fn unsent_claimed_entry_is_pushed_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replica.db");
    let hub = Arc::new(Hub::new());

    let id = {
        let db = Database::open(&path).unwrap();
        let record = Replica::new(db.clone(), "device-a")
            .create(json!({"n": 1}))
            .unwrap();
        assert_eq!(claim(&db)[0].status, EntryStatus::InFlight);
        record.id
    };

    let engine = restart(&path, &hub);
    let counts = engine
        .database()
        .with_connection(|conn| SqliteOutbox::new(conn).counts())
        .unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.in_flight, 0);

    let report = engine.run_once().await.unwrap();
    assert_eq!(report.accepted, 1);
    assert_eq!(hub.get(&id).unwrap().version, 1);
    assert_eq!(
        engine.database().get(&id).unwrap().unwrap().sync_status,
        SyncStatus::Synced
    );
}

#[tokio::test]
async fn entry_the_server_already_applied_is_not_duplicated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replica.db");
    let hub = Arc::new(Hub::new());

    let id = {
        let db = Database::open(&path).unwrap();
        let replica = Replica::new(db.clone(), "device-a");
        let record = replica.create(json!({"n": 1})).unwrap();
        let claimed = claim(&db);
        let wire: Vec<PushEntry> = claimed.iter().map(PushEntry::from).collect();
        // The server applied it; the process died before the answer came back
        hub.push(&wire);
        replica.update(&record.id, json!({"n": 2})).unwrap();
        record.id
    };

    let engine = restart(&path, &hub);
    let report = engine.run_once().await.unwrap();
    assert_eq!(report.coalesced, 0);
    assert_eq!(report.accepted, 2);

    let server = hub.get(&id).unwrap();
    assert_eq!(server.version, 2);
    assert_eq!(server.payload, json!({"n": 2}));

    let local = engine.database().get(&id).unwrap().unwrap();
    assert_eq!(local.version, 2);
    assert_eq!(local.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn watermark_and_records_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replica.db");
    let hub = Arc::new(Hub::new());

    let id = {
        let engine = restart(&path, &hub);
        let replica = Replica::new(engine.database().clone(), "device-a");
        let record = replica.create(json!({"kept": true})).unwrap();
        engine.run_once().await.unwrap();
        record.id
    };

    let engine = restart(&path, &hub);
    let report = engine.run_once().await.unwrap();
    assert_eq!(report.pushed, 0);
    assert_eq!(report.pulled, 0);
    assert_eq!(
        engine.database().get(&id).unwrap().unwrap().payload,
        json!({"kept": true})
    );
}
