//! Shared fixtures: devices syncing against one in-process hub.

#![allow(dead_code)]

use std::sync::Arc;

use offsync_core::db::{Database, OutboxRepository, SqliteOutbox};
use offsync_core::hub::Hub;
use offsync_core::models::{OutboxCounts, Record, RecordId};
use offsync_core::transport::LoopbackTransport;
use offsync_core::util::ManualClock;
use offsync_core::{Replica, RoundReport, SyncConfig, SyncEngine};

pub struct Device {
    pub clock: Arc<ManualClock>,
    pub replica: Replica,
    pub transport: LoopbackTransport,
    pub engine: SyncEngine<LoopbackTransport>,
}

impl Device {
    pub fn join(hub: &Arc<Hub>, origin: &str) -> Self {
        Self::with_config(hub, SyncConfig::default().with_origin(origin))
    }

    pub fn with_config(hub: &Arc<Hub>, config: SyncConfig) -> Self {
        let clock = Arc::new(ManualClock::starting_at(1_000));
        let db = Database::open_in_memory().unwrap();
        let transport = LoopbackTransport::new(Arc::clone(hub));
        let replica = Replica::with_clock(db.clone(), config.origin_id.clone(), clock.clone());
        let engine =
            SyncEngine::init_with_clock(db, transport.clone(), config, clock.clone()).unwrap();
        Self {
            clock,
            replica,
            transport,
            engine,
        }
    }

    pub async fn sync(&self) -> RoundReport {
        self.engine.run_once().await.unwrap()
    }

    pub fn record(&self, id: &RecordId) -> Record {
        self.replica.get(id).unwrap().unwrap()
    }

    pub fn outbox(&self) -> OutboxCounts {
        self.engine
            .database()
            .with_connection(|conn| SqliteOutbox::new(conn).counts())
            .unwrap()
    }
}
