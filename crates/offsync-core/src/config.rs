//! Sync engine configuration.
//!
//! Defaults suit an interactive client. Every value can be overridden through
//! `OFFSYNC_*` environment variables; out-of-range values are rejected rather
//! than clamped.

use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Tunables for the reconciliation engine and scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Outbox entries per push call
    pub batch_size: usize,
    /// Transport failures before an entry is marked `failed`
    pub max_retries: u32,
    /// Upper bound on each network call
    pub request_timeout: Duration,
    /// Records per pull page
    pub pull_limit: usize,
    /// Period of timer-triggered rounds
    pub sync_interval: Duration,
    /// First backoff delay after a failed round
    pub backoff_base: Duration,
    /// Backoff ceiling
    pub backoff_max: Duration,
    /// Fold never-sent entries of one record before pushing
    pub coalesce: bool,
    /// Identifies this device in records it produces
    pub origin_id: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_retries: 5,
            request_timeout: Duration::from_secs(30),
            pull_limit: 200,
            sync_interval: Duration::from_secs(60),
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
            coalesce: true,
            origin_id: "local".to_string(),
        }
    }
}

impl SyncConfig {
    /// Build from the process environment
    pub fn from_env() -> Result<Self> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let batch_size = ranged(&lookup, "OFFSYNC_BATCH_SIZE", defaults.batch_size, 1, 1_000)?;
        let max_retries = ranged(&lookup, "OFFSYNC_MAX_RETRIES", defaults.max_retries, 1, 100)?;
        let request_timeout = ranged(
            &lookup,
            "OFFSYNC_REQUEST_TIMEOUT_SECS",
            defaults.request_timeout.as_secs(),
            1,
            600,
        )?;
        let pull_limit = ranged(&lookup, "OFFSYNC_PULL_LIMIT", defaults.pull_limit, 1, 5_000)?;
        let sync_interval = ranged(
            &lookup,
            "OFFSYNC_SYNC_INTERVAL_SECS",
            defaults.sync_interval.as_secs(),
            1,
            86_400,
        )?;
        let backoff_base = ranged(
            &lookup,
            "OFFSYNC_BACKOFF_BASE_SECS",
            defaults.backoff_base.as_secs(),
            1,
            3_600,
        )?;
        let backoff_max = ranged(
            &lookup,
            "OFFSYNC_BACKOFF_MAX_SECS",
            defaults.backoff_max.as_secs(),
            1,
            86_400,
        )?;
        if backoff_max < backoff_base {
            return Err(Error::Config(
                "OFFSYNC_BACKOFF_MAX_SECS must be >= OFFSYNC_BACKOFF_BASE_SECS".to_string(),
            ));
        }

        let coalesce = match optional_trimmed(&lookup, "OFFSYNC_COALESCE") {
            None => defaults.coalesce,
            Some(value) => parse_bool(&value).ok_or_else(|| {
                Error::Config("OFFSYNC_COALESCE must be true or false".to_string())
            })?,
        };
        let origin_id =
            optional_trimmed(&lookup, "OFFSYNC_ORIGIN_ID").unwrap_or(defaults.origin_id);

        Ok(Self {
            batch_size,
            max_retries,
            request_timeout: Duration::from_secs(request_timeout),
            pull_limit,
            sync_interval: Duration::from_secs(sync_interval),
            backoff_base: Duration::from_secs(backoff_base),
            backoff_max: Duration::from_secs(backoff_max),
            coalesce,
            origin_id,
        })
    }

    /// Same configuration with a different origin
    #[must_use]
    pub fn with_origin(mut self, origin_id: impl Into<String>) -> Self {
        self.origin_id = origin_id.into();
        self
    }
}

fn ranged<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    min: T,
    max: T,
) -> Result<T>
where
    T: FromStr + PartialOrd + Display + Copy,
{
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let value = raw
        .parse::<T>()
        .map_err(|_| Error::Config(format!("{name} must be an integer in [{min}, {max}]")))?;
    if value < min || value > max {
        return Err(Error::Config(format!("{name} must be in [{min}, {max}]")));
    }
    Ok(value)
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    crate::util::normalize_text_option(lookup(name))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
