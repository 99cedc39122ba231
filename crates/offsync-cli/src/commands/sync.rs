use std::sync::Arc;
use std::time::Duration;

use offsync_core::db::{SqliteSyncStateRepository, SyncStateRepository};
use offsync_core::models::OutboxCounts;
use offsync_core::scheduler::SyncScheduler;
use offsync_core::state::{SyncPhase, SyncState};
use offsync_core::RoundReport;
use serde::Serialize;
use tokio::sync::{watch, Notify};

use crate::cli::SyncTargetArgs;
use crate::commands::common::{format_sync_timestamp, CliContext};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub state: String,
    pub origin_id: String,
    pub profile: String,
    pub server_url: Option<String>,
    pub watermark: Option<String>,
    pub last_round_at: Option<i64>,
    pub last_error: Option<String>,
    pub outbox: OutboxCounts,
}

pub async fn run_sync(target: &SyncTargetArgs, ctx: &CliContext) -> Result<RoundReport, CliError> {
    let target = ctx.sync_target(target)?;
    let engine = ctx.open_engine(&target)?;

    let report = engine.run_once().await?;
    for line in format_round_lines(&report) {
        println!("{line}");
    }
    if let Some(error) = report.transport_error.clone() {
        return Err(CliError::Transport(error));
    }
    Ok(report)
}

pub async fn run_daemon(
    target: &SyncTargetArgs,
    interval: Option<u64>,
    ctx: &CliContext,
) -> Result<(), CliError> {
    let target = ctx.sync_target(target)?;
    let mut ctx = ctx.clone();
    if let Some(secs) = interval {
        if secs == 0 {
            return Err(CliError::Config("--interval must be at least 1".to_string()));
        }
        ctx.sync_config.sync_interval = Duration::from_secs(secs);
    }

    let engine = Arc::new(ctx.open_engine(&target)?);
    let scheduler = SyncScheduler::new(Arc::clone(&engine));

    // The CLI has no reachability probe; failed rounds back off instead.
    let (_connectivity_tx, connectivity_rx) = watch::channel(true);
    let manual = Arc::new(Notify::new());
    manual.notify_one();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let signal_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing up");
            signal_engine.shutdown();
            shutdown_tx.send_replace(true);
        }
    });

    println!(
        "Syncing {} with {} every {}s (Ctrl-C to stop)",
        ctx.db_path.display(),
        target.server_url,
        ctx.sync_config.sync_interval.as_secs()
    );
    scheduler
        .run(connectivity_rx, Arc::clone(&manual), shutdown_rx)
        .await;
    println!("Stopped");
    Ok(())
}

pub fn load_status(ctx: &CliContext) -> Result<StatusReport, CliError> {
    let replica = ctx.open_replica()?;
    let counts = replica.outbox_counts()?;
    let (watermark, last_round_at, last_error) =
        replica.database().with_connection(|conn| {
            let state = SqliteSyncStateRepository::new(conn);
            Ok((state.watermark()?, state.last_round_at()?, state.last_error()?))
        })?;
    let server_url = ctx.sync_target(&SyncTargetArgs::default()).ok().map(|target| target.server_url);
    let state = SyncState::summarize(
        SyncPhase::Idle,
        last_error.is_some(),
        server_url.is_some(),
        &counts,
    );

    Ok(StatusReport {
        state: state.to_string(),
        origin_id: ctx.origin_id().to_string(),
        profile: ctx.profile_name.clone(),
        server_url,
        watermark,
        last_round_at,
        last_error,
        outbox: counts,
    })
}

pub fn run_status(as_json: bool, ctx: &CliContext) -> Result<(), CliError> {
    let status = load_status(ctx)?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("State:      {}", status.state);
    println!("Origin:     {}", status.origin_id);
    println!(
        "Server:     {}",
        status.server_url.as_deref().unwrap_or("(not configured)")
    );
    println!(
        "Last round: {}",
        status
            .last_round_at
            .map_or_else(|| "never".to_string(), format_sync_timestamp)
    );
    println!(
        "Watermark:  {}",
        status.watermark.as_deref().unwrap_or("(none)")
    );
    if let Some(error) = &status.last_error {
        println!("Last error: {error}");
    }
    println!(
        "Outbox:     {} pending, {} in flight, {} conflict, {} failed",
        status.outbox.pending, status.outbox.in_flight, status.outbox.conflict, status.outbox.failed
    );
    Ok(())
}

pub fn format_round_lines(report: &RoundReport) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(error) = &report.transport_error {
        lines.push(format!("Sync aborted: {error}"));
    } else if report.cancelled {
        lines.push("Sync cancelled".to_string());
    } else {
        lines.push("Sync completed".to_string());
    }
    lines.push(format!(
        "  pushed {} (accepted {}, local wins {}, server wins {}, flagged {}, rejected {})",
        report.pushed,
        report.accepted,
        report.local_wins,
        report.server_wins,
        report.flagged,
        report.rejected
    ));
    lines.push(format!(
        "  pulled {}, deferred {}",
        report.pulled, report.deferred
    ));
    if report.coalesced > 0 {
        lines.push(format!("  coalesced {} queued edits", report.coalesced));
    }
    for failure in &report.failures {
        lines.push(format!("  ! {failure}"));
    }
    lines
}

