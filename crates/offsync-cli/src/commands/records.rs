use offsync_core::Record;

use crate::commands::common::{
    format_record_line, now_millis, parse_record_id, record_to_item, resolve_payload, CliContext,
    RecordItem,
};
use crate::error::CliError;

pub fn run_create(payload: Option<&str>, ctx: &CliContext) -> Result<Record, CliError> {
    let payload = resolve_payload(payload)?;
    let record = ctx.open_replica()?.create(payload)?;
    println!("Created record {}", record.id);
    Ok(record)
}

pub fn run_update(id: &str, payload: Option<&str>, ctx: &CliContext) -> Result<Record, CliError> {
    let id = parse_record_id(id)?;
    let payload = resolve_payload(payload)?;
    let record = ctx.open_replica()?.update(&id, payload)?;
    println!("Updated record {} (queued against v{})", record.id, record.version);
    Ok(record)
}

pub fn run_delete(id: &str, ctx: &CliContext) -> Result<(), CliError> {
    let id = parse_record_id(id)?;
    ctx.open_replica()?.delete(&id)?;
    println!("Deleted record {id}");
    Ok(())
}

pub fn run_get(id: &str, as_json: bool, ctx: &CliContext) -> Result<(), CliError> {
    let record_id = parse_record_id(id)?;
    let record = ctx
        .open_replica()?
        .get(&record_id)?
        .ok_or_else(|| CliError::RecordNotFound(record_id.to_string()))?;

    if as_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&record_to_item(&record, now_millis()))?
        );
        return Ok(());
    }

    println!("id:       {}", record.id);
    println!("version:  {}", record.version);
    println!("status:   {}", record.sync_status);
    println!("origin:   {}", record.origin_id);
    if record.deleted {
        println!("deleted:  yes");
    }
    println!("{}", serde_json::to_string_pretty(&record.payload)?);
    Ok(())
}

pub fn list_records(limit: usize, ctx: &CliContext) -> Result<Vec<Record>, CliError> {
    let mut records = ctx.open_replica()?.list_active()?;
    records.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    records.truncate(limit);
    Ok(records)
}

pub fn run_list(limit: usize, as_json: bool, ctx: &CliContext) -> Result<(), CliError> {
    let records = list_records(limit, ctx)?;
    let now = now_millis();

    if as_json {
        let items = records
            .iter()
            .map(|record| record_to_item(record, now))
            .collect::<Vec<RecordItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No records yet.");
        return Ok(());
    }
    for record in &records {
        println!("{}", format_record_line(record, now));
    }
    Ok(())
}
