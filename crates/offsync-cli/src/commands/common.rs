use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;

use chrono::Utc;
use offsync_core::models::SyncConflict;
use offsync_core::transport::HttpTransport;
use offsync_core::{OutboxEntry, Record, RecordId, Replica, SyncConfig, SyncEngine};
use serde::Serialize;

use crate::cli::SyncTargetArgs;
use crate::config_profiles::{normalize_text_option, CliProfile};
use crate::error::CliError;

/// Everything a command needs to find its replica and server
#[derive(Debug, Clone)]
pub struct CliContext {
    pub db_path: PathBuf,
    pub profile_name: String,
    pub profile: CliProfile,
    pub sync_config: SyncConfig,
}

impl CliContext {
    pub fn new(db_path: PathBuf, profile_name: String, profile: CliProfile) -> Result<Self, CliError> {
        let mut sync_config = SyncConfig::from_env()?;
        if let Some(origin_id) = profile.origin_id() {
            sync_config.origin_id = origin_id;
        }
        Ok(Self {
            db_path,
            profile_name,
            profile,
            sync_config,
        })
    }

    pub fn origin_id(&self) -> &str {
        &self.sync_config.origin_id
    }

    pub fn open_replica(&self) -> Result<Replica, CliError> {
        Ok(Replica::open_path(&self.db_path, self.origin_id())?)
    }

    /// Server settings from flags, then environment, then profile
    pub fn sync_target(&self, args: &SyncTargetArgs) -> Result<SyncTarget, CliError> {
        resolve_sync_target(args, &self.profile, |name| env::var(name).ok())
    }

    pub fn open_engine(&self, target: &SyncTarget) -> Result<SyncEngine<HttpTransport>, CliError> {
        let transport = HttpTransport::new(
            target.server_url.clone(),
            target.token.clone(),
            self.sync_config.request_timeout,
        )?;
        let db = offsync_core::db::Database::open(&self.db_path)?;
        Ok(SyncEngine::init(db, transport, self.sync_config.clone())?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub server_url: String,
    pub token: Option<String>,
}

pub fn resolve_sync_target(
    args: &SyncTargetArgs,
    profile: &CliProfile,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<SyncTarget, CliError> {
    let server_url = normalize_text_option(args.server.clone())
        .or_else(|| normalize_text_option(lookup("OFFSYNC_SERVER_URL")))
        .or_else(|| profile.server_url())
        .ok_or(CliError::SyncNotConfigured)?;
    if !offsync_core::util::is_http_url(&server_url) {
        return Err(CliError::Config(format!(
            "server URL must start with http:// or https://, got {server_url}"
        )));
    }
    let token = normalize_text_option(args.token.clone())
        .or_else(|| normalize_text_option(lookup("OFFSYNC_TOKEN")))
        .or_else(|| profile.token());
    Ok(SyncTarget { server_url, token })
}

#[derive(Debug, Serialize)]
pub struct RecordItem {
    pub id: String,
    pub version: i64,
    pub sync_status: String,
    pub deleted: bool,
    pub origin_id: String,
    pub updated_at: i64,
    pub relative_time: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct OutboxEntryItem {
    pub sequence: i64,
    pub op: String,
    pub entity_id: String,
    pub status: String,
    pub base_version: i64,
    pub retry_count: u32,
    pub repush_count: u32,
    pub created_at: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PendingConflictItem {
    pub entity_id: String,
    pub sequence: i64,
    pub base_version: i64,
    pub local_payload: serde_json::Value,
    pub server_version: Option<i64>,
    pub server_deleted: Option<bool>,
    pub server_payload: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct ConflictLogItem {
    pub id: i64,
    pub entity_id: String,
    pub local_version: i64,
    pub server_version: i64,
    pub resolution: String,
    pub resolved_at: i64,
    pub resolved_at_iso: String,
}

pub fn record_to_item(record: &Record, now_ms: i64) -> RecordItem {
    RecordItem {
        id: record.id.to_string(),
        version: record.version,
        sync_status: record.sync_status.to_string(),
        deleted: record.deleted,
        origin_id: record.origin_id.clone(),
        updated_at: record.updated_at,
        relative_time: format_relative_time(record.updated_at, now_ms),
        payload: record.payload.clone(),
    }
}

pub fn outbox_entry_to_item(entry: &OutboxEntry) -> OutboxEntryItem {
    OutboxEntryItem {
        sequence: entry.sequence,
        op: entry.op.to_string(),
        entity_id: entry.entity_id.to_string(),
        status: entry.status.to_string(),
        base_version: entry.base_version,
        retry_count: entry.retry_count,
        repush_count: entry.repush_count,
        created_at: entry.created_at,
        last_error: entry.last_error.clone(),
    }
}

pub fn pending_conflict_to_item(entry: &OutboxEntry) -> PendingConflictItem {
    let server = entry.server_record.as_ref();
    PendingConflictItem {
        entity_id: entry.entity_id.to_string(),
        sequence: entry.sequence,
        base_version: entry.base_version,
        local_payload: entry.payload.payload.clone(),
        server_version: server.map(|record| record.version),
        server_deleted: server.map(|record| record.deleted),
        server_payload: server.map(|record| record.payload.clone()),
    }
}

pub fn conflict_log_to_item(conflict: &SyncConflict) -> ConflictLogItem {
    ConflictLogItem {
        id: conflict.id,
        entity_id: conflict.entity_id.clone(),
        local_version: conflict.local_version,
        server_version: conflict.server_version,
        resolution: conflict.resolution.to_string(),
        resolved_at: conflict.resolved_at,
        resolved_at_iso: format_sync_timestamp(conflict.resolved_at),
    }
}

pub fn format_record_line(record: &Record, now_ms: i64) -> String {
    format!(
        "{}  v{}  [{}]  {}  {}",
        record.id,
        record.version,
        record.sync_status,
        format_relative_time(record.updated_at, now_ms),
        payload_preview(&record.payload, 60)
    )
}

pub fn format_outbox_line(entry: &OutboxEntry) -> String {
    let error = entry
        .last_error
        .as_deref()
        .map(|error| format!(" error={error}"))
        .unwrap_or_default();
    format!(
        "#{} {} {} base=v{} [{}] retries={}{error}",
        entry.sequence, entry.op, entry.entity_id, entry.base_version, entry.status, entry.retry_count
    )
}

pub fn format_conflict_log_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{} {} local=v{} server=v{} {}",
                format_sync_timestamp(conflict.resolved_at),
                conflict.entity_id,
                conflict.local_version,
                conflict.server_version,
                conflict.resolution
            )
        })
        .collect()
}

pub fn payload_preview(payload: &serde_json::Value, max_chars: usize) -> String {
    let text = payload.to_string();
    if text.chars().count() <= max_chars {
        return text;
    }
    let truncated: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{truncated}...")
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn parse_record_id(raw: &str) -> Result<RecordId, CliError> {
    raw.trim()
        .parse::<RecordId>()
        .map_err(|_| CliError::InvalidId(raw.trim().to_string()))
}

/// Payload from the argument, or from stdin when piped
pub fn resolve_payload(raw: Option<&str>) -> Result<serde_json::Value, CliError> {
    if let Some(raw) = raw {
        return parse_payload(raw);
    }

    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Err(CliError::EmptyPayload);
    }
    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    parse_payload(&buffer)
}

pub fn parse_payload(raw: &str) -> Result<serde_json::Value, CliError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(CliError::EmptyPayload);
    }
    serde_json::from_str(raw).map_err(|error| CliError::InvalidPayload(error.to_string()))
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    if let Some(path) = cli_db_path.or_else(|| env::var_os("OFFSYNC_DB_PATH").map(PathBuf::from)) {
        return Ok(path);
    }
    default_db_path()
}

pub fn default_db_path() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("offsync").join("offsync.db"))
        .ok_or_else(|| CliError::Config("Failed to resolve CLI data directory".to_string()))
}
