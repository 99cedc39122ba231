//! In-process transport over a shared `Hub`, with fault injection.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{SyncTransport, TransportError};
use crate::hub::Hub;
use crate::protocol::{PullResponse, PushEntry, PushResult};

/// Transport that calls the hub directly.
///
/// Faults are armed ahead of time and consumed by the next calls, so tests
/// can reproduce outages and lost responses deterministically.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    hub: Arc<Hub>,
    faults: Arc<Faults>,
}

#[derive(Debug, Default)]
struct Faults {
    offline: AtomicBool,
    fail_next: AtomicU32,
    lose_next_push_response: AtomicU32,
    latency_ms: AtomicU64,
    push_calls: AtomicUsize,
    pull_calls: AtomicUsize,
}

/// Decrement `counter` if it is positive; true when a fault was consumed
fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl LoopbackTransport {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            faults: Arc::new(Faults::default()),
        }
    }

    /// The hub behind this transport
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Fail every call with a connection error until switched back
    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` calls before they reach the hub
    pub fn fail_next(&self, count: u32) {
        self.faults.fail_next.store(count, Ordering::SeqCst);
    }

    /// Apply the next `count` pushes on the hub, then time out as if the
    /// response never arrived
    pub fn lose_next_push_response(&self, count: u32) {
        self.faults
            .lose_next_push_response
            .store(count, Ordering::SeqCst);
    }

    /// Delay every call
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.faults.latency_ms.store(millis, Ordering::SeqCst);
    }

    pub fn push_calls(&self) -> usize {
        self.faults.push_calls.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self) -> usize {
        self.faults.pull_calls.load(Ordering::SeqCst)
    }

    async fn before_call(&self) -> Result<(), TransportError> {
        let latency = self.faults.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.faults.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("network unreachable".into()));
        }
        if take(&self.faults.fail_next) {
            return Err(TransportError::Connection("connection reset".into()));
        }
        Ok(())
    }
}

impl SyncTransport for LoopbackTransport {
    async fn push(&self, entries: &[PushEntry]) -> Result<Vec<PushResult>, TransportError> {
        self.faults.push_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;

        let results = self.hub.push(entries);
        if take(&self.faults.lose_next_push_response) {
            tracing::debug!(entries = entries.len(), "Dropping push response");
            return Err(TransportError::Timeout(Duration::ZERO));
        }
        Ok(results)
    }

    async fn pull(
        &self,
        since: Option<&str>,
        limit: usize,
    ) -> Result<PullResponse, TransportError> {
        self.faults.pull_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;

        self.hub.pull(since, limit).map_err(|error| TransportError::Http {
            status: 400,
            message: error.to_string(),
        })
    }
}
