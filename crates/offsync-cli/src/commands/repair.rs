//! Outbox inspection and the commands that unstick it.

use offsync_core::services::ManualResolution;
use offsync_core::{EntryStatus, OutboxEntry};

use crate::commands::common::{
    conflict_log_to_item, format_conflict_log_lines, format_outbox_line, outbox_entry_to_item,
    parse_record_id, payload_preview, pending_conflict_to_item, CliContext, ConflictLogItem,
    OutboxEntryItem, PendingConflictItem,
};
use crate::error::CliError;

pub fn run_outbox(
    status: Option<EntryStatus>,
    limit: usize,
    as_json: bool,
    ctx: &CliContext,
) -> Result<(), CliError> {
    let entries = ctx.open_replica()?.outbox(status, limit)?;

    if as_json {
        let items = entries
            .iter()
            .map(outbox_entry_to_item)
            .collect::<Vec<OutboxEntryItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("Outbox is empty.");
        return Ok(());
    }
    for entry in &entries {
        println!("{}", format_outbox_line(entry));
    }
    Ok(())
}

pub fn pending_conflicts(limit: usize, ctx: &CliContext) -> Result<Vec<OutboxEntry>, CliError> {
    Ok(ctx
        .open_replica()?
        .outbox(Some(EntryStatus::Conflict), limit)?)
}

pub fn run_conflicts(limit: usize, as_json: bool, ctx: &CliContext) -> Result<(), CliError> {
    let entries = pending_conflicts(limit, ctx)?;

    if as_json {
        let items = entries
            .iter()
            .map(pending_conflict_to_item)
            .collect::<Vec<PendingConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No conflicts waiting for a decision.");
        return Ok(());
    }
    for entry in &entries {
        let server = entry.server_record.as_ref().map_or_else(
            || "server: unknown".to_string(),
            |record| {
                format!(
                    "server v{}{}: {}",
                    record.version,
                    if record.deleted { " (deleted)" } else { "" },
                    payload_preview(&record.payload, 40)
                )
            },
        );
        println!(
            "{}  local on v{}: {}  |  {}",
            entry.entity_id,
            entry.base_version,
            payload_preview(&entry.payload.payload, 40),
            server
        );
    }
    println!("Settle with `offsync resolve <ID> --keep local|server`.");
    Ok(())
}

pub fn run_history(limit: usize, as_json: bool, ctx: &CliContext) -> Result<(), CliError> {
    let conflicts = ctx.open_replica()?.list_conflicts(limit)?;

    if as_json {
        let items = conflicts
            .iter()
            .map(conflict_log_to_item)
            .collect::<Vec<ConflictLogItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }
    for line in format_conflict_log_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub fn run_resolve(id: &str, choice: ManualResolution, ctx: &CliContext) -> Result<(), CliError> {
    let id = parse_record_id(id)?;
    let record = ctx.open_replica()?.resolve_conflict(&id, choice)?;
    match choice {
        ManualResolution::KeepLocal => {
            println!("Kept local value of {id}; it will be pushed on the next sync");
        }
        ManualResolution::KeepServer => {
            println!("Took server value of {id} (v{})", record.version);
        }
    }
    Ok(())
}

pub fn run_retry(id: &str, ctx: &CliContext) -> Result<usize, CliError> {
    let id = parse_record_id(id)?;
    let count = ctx.open_replica()?.retry_failed(&id)?;
    if count == 0 {
        println!("No failed changes for {id}");
    } else {
        println!("Queued {count} failed change(s) of {id} again");
    }
    Ok(count)
}

pub fn run_discard(id: &str, ctx: &CliContext) -> Result<usize, CliError> {
    let id = parse_record_id(id)?;
    let count = ctx.open_replica()?.discard_failed(&id)?;
    if count == 0 {
        println!("No failed changes for {id}");
    } else {
        println!("Discarded {count} failed change(s) of {id}");
    }
    Ok(count)
}
