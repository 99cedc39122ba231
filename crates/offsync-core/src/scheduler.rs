//! Decides when sync rounds run.
//!
//! At most one round is in flight per process. Triggers that arrive while a
//! round runs are dropped, and a round that hit the network is followed by
//! an exponential backoff window that only manual triggers may skip.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};

use crate::engine::{RoundReport, SyncEngine};
use crate::error::{Error, Result};
use crate::transport::SyncTransport;

/// Why a round was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Manual,
    Timer,
    ConnectivityRestored,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Manual => "manual",
            Self::Timer => "timer",
            Self::ConnectivityRestored => "connectivity_restored",
        })
    }
}

/// What happened to a trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Ran(RoundReport),
    /// Another round was already running
    Skipped,
    /// Inside the backoff window after a failed round
    BackingOff(Duration),
}

impl TriggerOutcome {
    pub const fn report(&self) -> Option<&RoundReport> {
        match self {
            Self::Ran(report) => Some(report),
            Self::Skipped | Self::BackingOff(_) => None,
        }
    }
}

#[derive(Debug)]
struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
    until: Option<Instant>,
}

impl Backoff {
    const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
            until: None,
        }
    }

    /// Ceiling of the next delay: `base * 2^(failures - 1)`, capped at `max`
    fn ceiling(&self) -> Duration {
        let exponent = self.failures.saturating_sub(1).min(20);
        self.base.saturating_mul(1 << exponent).min(self.max)
    }

    /// Jittered delay in `[ceiling / 2, ceiling]`
    fn next_delay(&self) -> Duration {
        let ceiling = u64::try_from(self.ceiling().as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(ceiling / 2..=ceiling))
    }

    fn record_failure(&mut self, now: Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.next_delay();
        self.until = Some(now + delay);
        delay
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.until = None;
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.until
            .and_then(|until| until.checked_duration_since(now))
            .filter(|left| !left.is_zero())
    }
}

/// Releases the single-flight flag when the round ends, even on panic
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Single-flight front door to `SyncEngine::run_once`
pub struct SyncScheduler<T> {
    engine: Arc<SyncEngine<T>>,
    in_flight: AtomicBool,
    backoff: Mutex<Backoff>,
}

impl<T: SyncTransport> SyncScheduler<T> {
    pub fn new(engine: Arc<SyncEngine<T>>) -> Self {
        let config = engine.config();
        let backoff = Backoff::new(config.backoff_base, config.backoff_max);
        Self {
            engine,
            in_flight: AtomicBool::new(false),
            backoff: Mutex::new(backoff),
        }
    }

    pub const fn engine(&self) -> &Arc<SyncEngine<T>> {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Rounds failed in a row
    pub fn consecutive_failures(&self) -> u32 {
        self.lock_backoff().failures
    }

    /// Time left before timer triggers are honoured again
    pub fn backoff_remaining(&self) -> Option<Duration> {
        self.lock_backoff().remaining(Instant::now())
    }

    fn lock_backoff(&self) -> MutexGuard<'_, Backoff> {
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request a round.
    ///
    /// Returns `Skipped` instead of waiting when a round is already running.
    pub async fn trigger(&self, trigger: Trigger) -> Result<TriggerOutcome> {
        if trigger != Trigger::Manual {
            if let Some(remaining) = self.backoff_remaining() {
                tracing::debug!(%trigger, remaining_ms = remaining.as_millis(), "Backing off");
                return Ok(TriggerOutcome::BackingOff(remaining));
            }
        }

        let Some(_guard) = FlightGuard::acquire(&self.in_flight) else {
            tracing::debug!(%trigger, "Round already running, trigger dropped");
            return Ok(TriggerOutcome::Skipped);
        };

        tracing::debug!(%trigger, "Starting sync round");
        match self.engine.run_once().await {
            Ok(report) => {
                if let Some(error) = &report.transport_error {
                    let delay = self.lock_backoff().record_failure(Instant::now());
                    tracing::warn!(
                        %error,
                        retry_in_ms = delay.as_millis(),
                        "Sync round aborted, backing off"
                    );
                } else {
                    self.lock_backoff().reset();
                }
                Ok(TriggerOutcome::Ran(report))
            }
            Err(Error::ShutDown) => Err(Error::ShutDown),
            Err(error) => {
                let delay = self.lock_backoff().record_failure(Instant::now());
                tracing::warn!(%error, retry_in_ms = delay.as_millis(), "Sync round failed, backing off");
                Err(error)
            }
        }
    }

    /// Drive rounds until `shutdown` flips to `true` or its sender goes away.
    ///
    /// Timer ticks are ignored while `connectivity` reports offline; a change
    /// from offline to online triggers a round straight away.
    pub async fn run(
        &self,
        mut connectivity: watch::Receiver<bool>,
        manual: Arc<Notify>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.engine.config().sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut online = *connectivity.borrow_and_update();
        let mut connectivity_open = true;

        tracing::info!(
            interval_secs = self.engine.config().sync_interval.as_secs(),
            online,
            "Sync scheduler started"
        );

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let trigger = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                () = manual.notified() => Trigger::Manual,
                changed = connectivity.changed(), if connectivity_open => {
                    if changed.is_err() {
                        connectivity_open = false;
                        continue;
                    }
                    let now_online = *connectivity.borrow_and_update();
                    let restored = now_online && !online;
                    online = now_online;
                    if !restored {
                        tracing::info!("Connectivity lost");
                        continue;
                    }
                    Trigger::ConnectivityRestored
                }
                _ = ticker.tick() => {
                    if !online {
                        continue;
                    }
                    Trigger::Timer
                }
            };

            match self.trigger(trigger).await {
                Ok(TriggerOutcome::Ran(report)) if !report.failures.is_empty() => {
                    for failure in &report.failures {
                        tracing::warn!(%failure, "Sync needs attention");
                    }
                }
                Ok(_) => {}
                Err(Error::ShutDown) => break,
                Err(error) => tracing::error!(%error, %trigger, "Sync round errored"),
            }
        }

        tracing::info!("Sync scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::db::Database;
    use crate::hub::Hub;
    use crate::services::Replica;
    use crate::transport::LoopbackTransport;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn scheduler(config: SyncConfig) -> (Arc<SyncScheduler<LoopbackTransport>>, LoopbackTransport, Replica) {
        let hub = Arc::new(Hub::new());
        let transport = LoopbackTransport::new(hub);
        let db = Database::open_in_memory().unwrap();
        let replica = Replica::new(db.clone(), "device-a");
        let engine = SyncEngine::init(db, transport.clone(), config).unwrap();
        (
            Arc::new(SyncScheduler::new(Arc::new(engine))),
            transport,
            replica,
        )
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(5));
        let now = Instant::now();

        let first = backoff.record_failure(now);
        assert!(first >= Duration::from_secs(1) && first <= Duration::from_secs(2));
        assert_eq!(backoff.ceiling(), Duration::from_secs(2));

        backoff.record_failure(now);
        assert_eq!(backoff.ceiling(), Duration::from_secs(4));

        let capped = backoff.record_failure(now);
        assert_eq!(backoff.ceiling(), Duration::from_secs(5));
        assert!(capped >= Duration::from_millis(2_500) && capped <= Duration::from_secs(5));

        backoff.reset();
        assert_eq!(backoff.remaining(now), None);
        assert_eq!(backoff.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_trigger_is_skipped() {
        let (scheduler, transport, replica) = scheduler(SyncConfig::default());
        replica.create(json!({"n": 1})).unwrap();
        transport.set_latency(Duration::from_millis(100));

        let (first, second) = tokio::join!(
            scheduler.trigger(Trigger::Timer),
            scheduler.trigger(Trigger::ConnectivityRestored)
        );

        assert_eq!(first.unwrap().report().map(|r| r.accepted), Some(1));
        assert_eq!(second.unwrap(), TriggerOutcome::Skipped);
        assert!(!scheduler.is_running());
        assert_eq!(transport.push_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_round_backs_off_timer_but_not_manual() {
        let (scheduler, transport, replica) = scheduler(SyncConfig::default());
        replica.create(json!({})).unwrap();
        transport.set_offline(true);

        let outcome = scheduler.trigger(Trigger::Timer).await.unwrap();
        assert!(outcome.report().unwrap().is_aborted());
        assert_eq!(scheduler.consecutive_failures(), 1);

        assert!(matches!(
            scheduler.trigger(Trigger::Timer).await.unwrap(),
            TriggerOutcome::BackingOff(_)
        ));

        transport.set_offline(false);
        let manual = scheduler.trigger(Trigger::Manual).await.unwrap();
        assert_eq!(manual.report().map(|r| r.accepted), Some(1));
        assert_eq!(scheduler.consecutive_failures(), 0);
        assert_eq!(scheduler.backoff_remaining(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_window_expires() {
        let (scheduler, transport, _replica) = scheduler(SyncConfig::default());
        transport.set_offline(true);
        scheduler.trigger(Trigger::Timer).await.unwrap();
        transport.set_offline(false);

        tokio::time::sleep(SyncConfig::default().backoff_base).await;
        assert!(matches!(
            scheduler.trigger(Trigger::Timer).await.unwrap(),
            TriggerOutcome::Ran(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_follows_connectivity_and_stops_on_shutdown() {
        let config = SyncConfig {
            sync_interval: Duration::from_secs(3_600),
            ..SyncConfig::default()
        };
        let (scheduler, transport, replica) = scheduler(config);
        let record = replica.create(json!({"title": "offline note"})).unwrap();

        let (online_tx, online_rx) = watch::channel(false);
        let (stop_tx, stop_rx) = watch::channel(false);
        let manual = Arc::new(Notify::new());
        let handle = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            let manual = Arc::clone(&manual);
            async move { scheduler.run(online_rx, manual, stop_rx).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.push_calls(), 0);

        online_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.push_calls(), 1);
        assert!(transport.hub().get(&record.id).is_some());

        manual.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.pull_calls(), 2);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
