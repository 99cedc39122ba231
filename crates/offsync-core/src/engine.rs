//! Reconciliation engine.
//!
//! A round moves through `Idle -> Pushing -> Pulling -> Idle`:
//!
//! - **Push** claims outbox batches with `next_batch`, sends each batch in one
//!   call and settles every entry from its per-entry result. Conflicts go
//!   through the resolver; a local win is re-pushed once within the round.
//! - **Pull** merges server changes after the stored watermark, deferring
//!   records whose local mutations are still unconfirmed.
//!
//! Every store and outbox mutation is a short synchronous transaction. Only
//! the network calls await, and each is bounded by the request timeout. A
//! transport failure aborts the round: the entries that were on the wire count
//! a retry and everything still claimed returns to `pending`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::Connection;

use crate::config::SyncConfig;
use crate::db::{
    ConflictRepository, Database, NewSyncConflict, OutboxRepository, RecordRepository,
    SqliteConflictRepository, SqliteOutbox, SqliteRecordRepository, SqliteSyncStateRepository,
    SyncStateRepository,
};
use crate::error::{Error, Result};
use crate::models::{ConflictResolution, EntryStatus, OutboxEntry, Record, RecordId, SyncStatus};
use crate::protocol::{PushEntry, PushOutcome, PushResult};
use crate::resolver::{self, Decision};
use crate::state::{PhaseCell, SyncPhase, SyncState};
use crate::transport::{SyncTransport, TransportError};
use crate::util::{Clock, SystemClock};

/// Cooperative cancellation for a running round.
///
/// Checked between batches and pull pages, never while an entry is on the
/// wire.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A failure the user has to act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFailure {
    /// The server refused the mutation for good
    Rejected {
        entity_id: RecordId,
        sequence: i64,
        reason: String,
    },
    /// The entry ran out of transport retries
    RetryCeilingExceeded {
        entity_id: RecordId,
        sequence: i64,
        retries: u32,
    },
    /// Automatic resolution gave up after the re-push also conflicted
    ConflictFlagged { entity_id: RecordId, sequence: i64 },
}

impl SyncFailure {
    pub const fn entity_id(&self) -> RecordId {
        match self {
            Self::Rejected { entity_id, .. }
            | Self::RetryCeilingExceeded { entity_id, .. }
            | Self::ConflictFlagged { entity_id, .. } => *entity_id,
        }
    }

    /// The error this failure surfaces as, if it is an error at all
    pub fn to_error(&self) -> Option<Error> {
        match self {
            Self::Rejected {
                entity_id, reason, ..
            } => Some(Error::PermanentRejection {
                id: entity_id.to_string(),
                reason: reason.clone(),
            }),
            Self::RetryCeilingExceeded {
                entity_id, retries, ..
            } => Some(Error::RetryCeilingExceeded {
                id: entity_id.to_string(),
                retries: *retries,
            }),
            Self::ConflictFlagged { .. } => None,
        }
    }
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected {
                entity_id, reason, ..
            } => write!(f, "{entity_id}: rejected by server: {reason}"),
            Self::RetryCeilingExceeded {
                entity_id, retries, ..
            } => write!(f, "{entity_id}: gave up after {retries} attempts"),
            Self::ConflictFlagged { entity_id, .. } => {
                write!(f, "{entity_id}: conflict needs manual resolution")
            }
        }
    }
}

/// What a round did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// Entries folded away before pushing
    pub coalesced: usize,
    /// Entries sent, re-pushes included
    pub pushed: usize,
    pub accepted: usize,
    /// Conflicts resolved by re-pushing the local value
    pub local_wins: usize,
    /// Conflicts resolved by taking the server value
    pub server_wins: usize,
    pub flagged: usize,
    pub rejected: usize,
    /// Entries that failed in transit and will be retried
    pub retried: usize,
    /// Entries that hit the retry ceiling
    pub failed: usize,
    /// Server records merged into the local store
    pub pulled: usize,
    /// Server records parked behind local mutations
    pub deferred: usize,
    pub failures: Vec<SyncFailure>,
    /// Set when the round was aborted by a network failure
    pub transport_error: Option<TransportError>,
    pub cancelled: bool,
}

impl RoundReport {
    pub const fn is_aborted(&self) -> bool {
        self.transport_error.is_some()
    }
}

enum Merge {
    Applied,
    Deferred,
    Ignored,
}

/// Sync status a record should carry given its outbox entries
pub(crate) fn derived_status(conn: &Connection, id: &RecordId) -> Result<SyncStatus> {
    let outbox = SqliteOutbox::new(conn);
    let outstanding = outbox.outstanding_for(id)?;
    if outstanding
        .iter()
        .any(|entry| entry.status == EntryStatus::Conflict)
    {
        return Ok(SyncStatus::Conflict);
    }
    if !outbox.entries_with_status(id, EntryStatus::Failed)?.is_empty() {
        return Ok(SyncStatus::Failed);
    }
    Ok(if outstanding.is_empty() {
        SyncStatus::Synced
    } else {
        SyncStatus::Pending
    })
}

/// Store a server record unless the local copy is already newer
pub(crate) fn apply_server_record(conn: &Connection, server: &Record) -> Result<bool> {
    let records = SqliteRecordRepository::new(conn);
    if let Some(stored) = records.get(&server.id)? {
        if stored.version > server.version {
            return Ok(false);
        }
    }
    let status = derived_status(conn, &server.id)?;
    records.upsert(&server.clone().with_status(status))?;
    Ok(true)
}

fn merge_incoming(conn: &Connection, incoming: &Record, now: i64) -> Result<Merge> {
    let state = SqliteSyncStateRepository::new(conn);
    let outstanding = SqliteOutbox::new(conn).outstanding_for(&incoming.id)?;
    let blocked = outstanding.iter().any(|entry| {
        entry.status == EntryStatus::Conflict || entry.base_version >= incoming.version
    });
    if blocked {
        state.defer(incoming, now)?;
        return Ok(Merge::Deferred);
    }

    state.clear_deferred(&incoming.id)?;
    if apply_server_record(conn, incoming)? {
        tracing::debug!(id = %incoming.id, version = incoming.version, "Merged server record");
        Ok(Merge::Applied)
    } else {
        Ok(Merge::Ignored)
    }
}

/// Drives sync rounds for one local replica against one server
pub struct SyncEngine<T> {
    db: Database,
    transport: T,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    phase: PhaseCell,
    cancel: CancelFlag,
    shut_down: AtomicBool,
}

impl<T: SyncTransport> SyncEngine<T> {
    /// Start an engine over an opened store.
    ///
    /// Entries left `in_flight` by a crashed process go back to `pending`;
    /// the server recognises any that it already applied when they are
    /// replayed.
    pub fn init(db: Database, transport: T, config: SyncConfig) -> Result<Self> {
        Self::init_with_clock(db, transport, config, Arc::new(SystemClock::new()))
    }

    pub fn init_with_clock(
        db: Database,
        transport: T,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let reverted = db.apply_in_transaction(|tx| SqliteOutbox::new(tx).revert_in_flight())?;
        if reverted > 0 {
            tracing::warn!(reverted, "Recovered in-flight outbox entries");
        }
        Ok(Self {
            db,
            transport,
            config,
            clock,
            phase: PhaseCell::default(),
            cancel: CancelFlag::default(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }

    pub const fn transport(&self) -> &T {
        &self.transport
    }

    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase.get()
    }

    /// Handle for cancelling the current round from elsewhere
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Stop accepting rounds and cancel the one in progress
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
            tracing::info!("Sync engine shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// User-facing summary of where this replica stands
    pub fn status(&self, online: bool) -> Result<SyncState> {
        let (counts, last_error) = self.db.with_connection(|conn| {
            Ok((
                SqliteOutbox::new(conn).counts()?,
                SqliteSyncStateRepository::new(conn).last_error()?,
            ))
        })?;
        Ok(SyncState::summarize(
            self.phase(),
            last_error.is_some(),
            online,
            &counts,
        ))
    }

    /// Run one full round: push the outbox, then pull server changes.
    ///
    /// Network failures do not surface as `Err`; they abort the round and are
    /// reported in `RoundReport::transport_error`. `Err` means the local store
    /// failed or the engine was shut down.
    pub async fn run_once(&self) -> Result<RoundReport> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }

        let mut report = RoundReport::default();
        let outcome = self.run_round(&mut report).await;
        self.phase.set(SyncPhase::Idle);
        if !self.is_shut_down() {
            self.cancel.reset();
        }

        match outcome {
            Ok(()) => {
                let error = report.transport_error.as_ref().map(ToString::to_string);
                self.record_round(error.as_deref())?;
                tracing::info!(
                    pushed = report.pushed,
                    accepted = report.accepted,
                    local_wins = report.local_wins,
                    server_wins = report.server_wins,
                    flagged = report.flagged,
                    rejected = report.rejected,
                    failed = report.failed,
                    pulled = report.pulled,
                    deferred = report.deferred,
                    aborted = report.is_aborted(),
                    cancelled = report.cancelled,
                    "Sync round finished"
                );
                Ok(report)
            }
            Err(error) => {
                tracing::error!(%error, "Sync round failed");
                if let Err(revert_error) = self
                    .db
                    .apply_in_transaction(|tx| SqliteOutbox::new(tx).revert_in_flight())
                {
                    tracing::error!(%revert_error, "Failed to release claimed outbox entries");
                }
                if let Err(record_error) = self.record_round(Some(&error.to_string())) {
                    tracing::error!(%record_error, "Failed to record round outcome");
                }
                Err(error)
            }
        }
    }

    fn record_round(&self, error: Option<&str>) -> Result<()> {
        let now = self.clock.now_millis();
        self.db.apply_in_transaction(|tx| {
            SqliteSyncStateRepository::new(tx).record_round(now, error)
        })
    }

    async fn run_round(&self, report: &mut RoundReport) -> Result<()> {
        self.phase.set(SyncPhase::Pushing);
        if self.config.coalesce {
            report.coalesced = self.coalesce()?;
        }
        if !self.push_phase(report).await? {
            return Ok(());
        }

        self.phase.set(SyncPhase::Pulling);
        self.pull_phase(report).await
    }

    fn should_stop(&self, report: &mut RoundReport) -> bool {
        if self.cancel.is_cancelled() {
            tracing::info!("Sync round cancelled");
            report.cancelled = true;
            true
        } else {
            false
        }
    }

    async fn call<R>(
        &self,
        request: impl Future<Output = std::result::Result<R, TransportError>>,
    ) -> std::result::Result<R, TransportError> {
        let limit = self.config.request_timeout;
        match tokio::time::timeout(limit, request).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(limit)),
        }
    }

    fn coalesce(&self) -> Result<usize> {
        self.db.apply_in_transaction(|tx| {
            let folded = SqliteOutbox::new(tx).coalesce()?;
            let records = SqliteRecordRepository::new(tx);
            for id in &folded.cancelled {
                records.set_sync_status(id, derived_status(tx, id)?)?;
            }
            Ok(folded.removed)
        })
    }

    // ---- push ----

    /// Returns `false` when the round must stop before pulling
    async fn push_phase(&self, report: &mut RoundReport) -> Result<bool> {
        loop {
            if self.should_stop(report) {
                return Ok(false);
            }

            let batch_size = self.config.batch_size;
            let mut outgoing = self
                .db
                .apply_in_transaction(|tx| SqliteOutbox::new(tx).next_batch(batch_size))?;
            if outgoing.is_empty() {
                return Ok(true);
            }

            // Re-pushes belong to the same entries, so they finish before any
            // cancellation is honoured.
            let retried_before = report.retried;
            while !outgoing.is_empty() {
                match self.push_batch(&outgoing, report).await? {
                    Some(repush) => outgoing = repush,
                    None => return Ok(false),
                }
            }

            // Entries handed back for retry wait for the next round
            if report.retried > retried_before {
                return Ok(true);
            }
        }
    }

    /// Send one batch and settle each entry. Returns the entries to re-push,
    /// or `None` when the transport failed.
    async fn push_batch(
        &self,
        entries: &[OutboxEntry],
        report: &mut RoundReport,
    ) -> Result<Option<Vec<OutboxEntry>>> {
        let wire: Vec<PushEntry> = entries.iter().map(PushEntry::from).collect();
        report.pushed += entries.len();
        tracing::debug!(entries = entries.len(), "Pushing outbox batch");

        let results = match self.call(self.transport.push(&wire)).await {
            Ok(results) => results,
            Err(error) => {
                self.abort_push(entries, &error, report)?;
                report.transport_error = Some(error);
                return Ok(None);
            }
        };

        let mut by_sequence: HashMap<i64, PushResult> = results
            .into_iter()
            .map(|result| (result.sequence_ref, result))
            .collect();

        let mut repush = Vec::new();
        for entry in entries {
            match by_sequence.remove(&entry.sequence) {
                Some(result) => {
                    if let Some(next) = self.settle(entry, result, report)? {
                        repush.push(next);
                    }
                }
                None => self.fail_entry(entry, "server returned no result for entry", report)?,
            }
        }
        Ok(Some(repush))
    }

    fn abort_push(
        &self,
        entries: &[OutboxEntry],
        error: &TransportError,
        report: &mut RoundReport,
    ) -> Result<()> {
        tracing::warn!(%error, entries = entries.len(), "Push failed, aborting round");
        let message = error.to_string();
        for entry in entries {
            self.fail_entry(entry, &message, report)?;
        }
        let reverted = self
            .db
            .apply_in_transaction(|tx| SqliteOutbox::new(tx).revert_in_flight())?;
        if reverted > 0 {
            tracing::debug!(reverted, "Released claimed outbox entries");
        }
        Ok(())
    }

    /// Count a transport failure against one entry
    fn fail_entry(&self, entry: &OutboxEntry, error: &str, report: &mut RoundReport) -> Result<()> {
        let max_retries = self.config.max_retries;
        let status = self.db.apply_in_transaction(|tx| {
            let status = SqliteOutbox::new(tx).mark_failed(entry.sequence, max_retries, error)?;
            if status == EntryStatus::Failed {
                SqliteRecordRepository::new(tx)
                    .set_sync_status(&entry.entity_id, derived_status(tx, &entry.entity_id)?)?;
            }
            Ok(status)
        })?;

        if status == EntryStatus::Failed {
            let retries = entry.retry_count + 1;
            tracing::warn!(
                id = %entry.entity_id,
                sequence = entry.sequence,
                retries,
                "Outbox entry exhausted its retries"
            );
            report.failed += 1;
            report.failures.push(SyncFailure::RetryCeilingExceeded {
                entity_id: entry.entity_id,
                sequence: entry.sequence,
                retries,
            });
        } else {
            tracing::debug!(id = %entry.entity_id, sequence = entry.sequence, "Will retry entry");
            report.retried += 1;
        }
        Ok(())
    }

    fn settle(
        &self,
        entry: &OutboxEntry,
        result: PushResult,
        report: &mut RoundReport,
    ) -> Result<Option<OutboxEntry>> {
        match result.outcome {
            PushOutcome::Accepted => {
                let Some(new_version) = result.new_version else {
                    self.fail_entry(entry, "accepted result without new_version", report)?;
                    return Ok(None);
                };
                self.accept(entry, new_version)?;
                report.accepted += 1;
                Ok(None)
            }
            PushOutcome::Conflict => {
                let Some(server) = result.server_record else {
                    self.fail_entry(entry, "conflict result without server record", report)?;
                    return Ok(None);
                };
                self.resolve_conflict(entry, &server, report)
            }
            PushOutcome::Rejected => {
                let reason = result
                    .reason
                    .unwrap_or_else(|| "rejected by server".to_string());
                self.reject(entry, &reason)?;
                report.rejected += 1;
                report.failures.push(SyncFailure::Rejected {
                    entity_id: entry.entity_id,
                    sequence: entry.sequence,
                    reason,
                });
                Ok(None)
            }
        }
    }

    fn accept(&self, entry: &OutboxEntry, new_version: i64) -> Result<()> {
        self.db.apply_in_transaction(|tx| {
            let outbox = SqliteOutbox::new(tx);
            let records = SqliteRecordRepository::new(tx);
            outbox.mark_synced(entry.sequence)?;
            outbox.rebase(&entry.entity_id, entry.sequence, new_version)?;

            // Later local edits already live in the stored record; otherwise
            // the pushed snapshot is exactly what the server now holds.
            let later_edits = outbox
                .outstanding_for(&entry.entity_id)?
                .iter()
                .any(|later| later.sequence > entry.sequence);
            let mut record = match records.get(&entry.entity_id)? {
                Some(stored) if later_edits || stored.version > new_version => stored,
                _ => entry.payload.clone(),
            };
            record.version = record.version.max(new_version);
            record.sync_status = derived_status(tx, &entry.entity_id)?;
            records.upsert(&record)
        })?;

        tracing::debug!(
            id = %entry.entity_id,
            sequence = entry.sequence,
            version = new_version,
            "Push accepted"
        );
        Ok(())
    }

    fn resolve_conflict(
        &self,
        entry: &OutboxEntry,
        server: &Record,
        report: &mut RoundReport,
    ) -> Result<Option<OutboxEntry>> {
        let local = &entry.payload;
        let decision = resolver::escalate(
            resolver::resolve(local, entry.base_version, server),
            entry.repush_count,
            local,
            server,
        );
        let now = self.clock.now_millis();
        let logged = |resolution| {
            NewSyncConflict::between(local, entry.base_version, server, resolution, now)
        };

        match decision {
            Decision::Accept => {
                self.db.apply_in_transaction(|tx| {
                    SqliteOutbox::new(tx).prepare_repush(entry.sequence, server.version)?;
                    SqliteConflictRepository::new(tx)
                        .log_conflict(&logged(ConflictResolution::LocalWins))?;
                    Ok(())
                })?;
                report.local_wins += 1;
                tracing::debug!(id = %entry.entity_id, "Local value wins, re-pushing");

                let mut next = entry.clone();
                next.base_version = server.version;
                next.repush_count += 1;
                Ok(Some(next))
            }
            Decision::Overwrite(server) => {
                self.db.apply_in_transaction(|tx| {
                    let outbox = SqliteOutbox::new(tx);
                    outbox.discard(entry.sequence)?;
                    // Queued edits still own the local payload; park the
                    // server copy until they settle.
                    if outbox.outstanding_for(&entry.entity_id)?.is_empty() {
                        apply_server_record(tx, &server)?;
                    } else {
                        SqliteSyncStateRepository::new(tx).defer(&server, now)?;
                    }
                    SqliteConflictRepository::new(tx)
                        .log_conflict(&logged(ConflictResolution::ServerWins))?;
                    Ok(())
                })?;
                report.server_wins += 1;
                tracing::debug!(id = %entry.entity_id, version = server.version, "Server value wins");
                Ok(None)
            }
            Decision::Flag { server, .. } => {
                self.db.apply_in_transaction(|tx| {
                    SqliteOutbox::new(tx).mark_conflict(entry.sequence, &server)?;
                    SqliteRecordRepository::new(tx)
                        .set_sync_status(&entry.entity_id, SyncStatus::Conflict)?;
                    SqliteConflictRepository::new(tx)
                        .log_conflict(&logged(ConflictResolution::Flagged))?;
                    Ok(())
                })?;
                tracing::warn!(
                    id = %entry.entity_id,
                    sequence = entry.sequence,
                    "Conflict persisted after re-push, flagged for manual resolution"
                );
                report.flagged += 1;
                report.failures.push(SyncFailure::ConflictFlagged {
                    entity_id: entry.entity_id,
                    sequence: entry.sequence,
                });
                Ok(None)
            }
        }
    }

    fn reject(&self, entry: &OutboxEntry, reason: &str) -> Result<()> {
        self.db.apply_in_transaction(|tx| {
            SqliteOutbox::new(tx).mark_rejected(entry.sequence, reason)?;
            SqliteRecordRepository::new(tx)
                .set_sync_status(&entry.entity_id, derived_status(tx, &entry.entity_id)?)
        })?;
        tracing::warn!(id = %entry.entity_id, sequence = entry.sequence, reason, "Push rejected");
        Ok(())
    }

    // ---- pull ----

    async fn pull_phase(&self, report: &mut RoundReport) -> Result<()> {
        report.pulled += self.replay_deferred()?;

        loop {
            if self.should_stop(report) {
                return Ok(());
            }

            let since = self
                .db
                .with_connection(|conn| SqliteSyncStateRepository::new(conn).watermark())?;
            let page = match self
                .call(self.transport.pull(since.as_deref(), self.config.pull_limit))
                .await
            {
                Ok(page) => page,
                Err(error) => {
                    tracing::warn!(%error, "Pull failed, aborting round");
                    report.transport_error = Some(error);
                    return Ok(());
                }
            };

            let now = self.clock.now_millis();
            self.db.apply_in_transaction(|tx| {
                for record in &page.records {
                    match merge_incoming(tx, record, now)? {
                        Merge::Applied => report.pulled += 1,
                        Merge::Deferred => report.deferred += 1,
                        Merge::Ignored => {}
                    }
                }
                SqliteSyncStateRepository::new(tx).set_watermark(&page.new_watermark)
            })?;

            if !page.has_more || page.records.is_empty() {
                return Ok(());
            }
        }
    }

    /// Retry merging records parked by earlier pulls
    fn replay_deferred(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        self.db.apply_in_transaction(|tx| {
            let mut applied = 0;
            for record in SqliteSyncStateRepository::new(tx).deferred()? {
                if matches!(merge_incoming(tx, &record, now)?, Merge::Applied) {
                    applied += 1;
                }
            }
            Ok(applied)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use crate::models::{NewOutboxEntry, Operation};
    use crate::transport::LoopbackTransport;
    use crate::util::ManualClock;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Fixture {
        hub: Arc<Hub>,
        transport: LoopbackTransport,
        engine: SyncEngine<LoopbackTransport>,
    }

    fn fixture() -> Fixture {
        let hub = Arc::new(Hub::new());
        let transport = LoopbackTransport::new(Arc::clone(&hub));
        let engine = SyncEngine::init_with_clock(
            Database::open_in_memory().unwrap(),
            transport.clone(),
            SyncConfig::default().with_origin("device-a"),
            Arc::new(ManualClock::starting_at(1_000)),
        )
        .unwrap();
        Fixture {
            hub,
            transport,
            engine,
        }
    }

    /// Write a record and its outbox entry the way the replica service does
    fn write(db: &Database, record: &Record, op: Operation, base_version: i64) {
        db.apply_in_transaction(|tx| {
            SqliteRecordRepository::new(tx).upsert(record)?;
            SqliteOutbox::new(tx).append(&NewOutboxEntry::new(
                op,
                record.clone(),
                base_version,
                record.updated_at,
            ))?;
            Ok(())
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_create_is_pushed_and_marked_synced() {
        let fx = fixture();
        let record = Record::new(json!({"name": "Acme"}), "device-a", 10);
        write(fx.engine.database(), &record, Operation::Create, 0);

        let report = fx.engine.run_once().await.unwrap();
        assert_eq!(report.accepted, 1);
        assert!(!report.is_aborted());

        let local = fx.engine.database().get(&record.id).unwrap().unwrap();
        assert_eq!(local.version, 1);
        assert_eq!(local.sync_status, SyncStatus::Synced);
        assert_eq!(fx.hub.get(&record.id).unwrap().payload, json!({"name": "Acme"}));
        assert_eq!(fx.engine.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_transport_failure_aborts_and_retries_next_round() {
        let fx = fixture();
        let record = Record::new(json!({}), "device-a", 10);
        write(fx.engine.database(), &record, Operation::Create, 0);
        fx.transport.fail_next(1);

        let report = fx.engine.run_once().await.unwrap();
        assert!(report.is_aborted());
        assert_eq!(report.retried, 1);
        assert_eq!(fx.transport.pull_calls(), 0);

        let pending = fx.engine.database().with_connection(|conn| {
            SqliteOutbox::new(conn).list(None, 10)
        });
        let pending = pending.unwrap();
        assert_eq!(pending[0].status, EntryStatus::Pending);
        assert_eq!(pending[0].retry_count, 1);

        let report = fx.engine.run_once().await.unwrap();
        assert_eq!(report.accepted, 1);
        assert!(fx.hub.get(&record.id).is_some());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_rounds() {
        let fx = fixture();
        fx.engine.shutdown();
        assert!(matches!(fx.engine.run_once().await, Err(Error::ShutDown)));
        assert!(fx.engine.cancel_flag().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_round_stops_before_pushing() {
        let fx = fixture();
        let record = Record::new(json!({}), "device-a", 10);
        write(fx.engine.database(), &record, Operation::Create, 0);

        fx.engine.cancel_flag().cancel();
        let report = fx.engine.run_once().await.unwrap();
        assert!(report.cancelled);
        assert_eq!(fx.transport.push_calls(), 0);

        // The flag only applies to one round
        let report = fx.engine.run_once().await.unwrap();
        assert_eq!(report.accepted, 1);
    }

    #[tokio::test]
    async fn test_missing_result_counts_as_transport_failure() {
        struct Silent;

        impl SyncTransport for Silent {
            async fn push(
                &self,
                _entries: &[PushEntry],
            ) -> std::result::Result<Vec<PushResult>, TransportError> {
                Ok(Vec::new())
            }

            async fn pull(
                &self,
                since: Option<&str>,
                _limit: usize,
            ) -> std::result::Result<crate::protocol::PullResponse, TransportError> {
                Ok(crate::protocol::PullResponse {
                    records: Vec::new(),
                    new_watermark: since.unwrap_or("0").to_string(),
                    has_more: false,
                })
            }
        }

        let engine = SyncEngine::init(
            Database::open_in_memory().unwrap(),
            Silent,
            SyncConfig::default(),
        )
        .unwrap();
        let record = Record::new(json!({}), "local", 10);
        write(engine.database(), &record, Operation::Create, 0);

        let report = engine.run_once().await.unwrap();
        assert_eq!(report.retried, 1);
        assert!(!report.is_aborted());
    }

    #[tokio::test]
    async fn test_round_outcome_is_recorded() {
        let fx = fixture();
        fx.transport.set_offline(true);
        fx.engine.run_once().await.unwrap();
        assert_eq!(fx.engine.status(true).unwrap(), SyncState::Error);

        fx.transport.set_offline(false);
        fx.engine.run_once().await.unwrap();
        assert_eq!(fx.engine.status(true).unwrap(), SyncState::Synced);
        assert_eq!(fx.engine.status(false).unwrap(), SyncState::Offline);
    }
}
