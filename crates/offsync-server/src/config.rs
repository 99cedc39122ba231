use std::collections::HashMap;
use std::env;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Bearer token required on `/v1`; open access when unset
    pub token: Option<String>,
    /// Page size cap for pulls
    pub pull_limit: usize,
    /// Entries accepted per push request
    pub max_push_entries: usize,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("pull_limit", &self.pull_limit)
            .field("max_push_entries", &self.max_push_entries)
            .finish()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            token: None,
            pull_limit: 500,
            max_push_entries: 500,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let bind_addr =
            optional_trimmed(&lookup, "OFFSYNC_SERVER_BIND_ADDR").unwrap_or(defaults.bind_addr);
        let token = optional_trimmed(&lookup, "OFFSYNC_SERVER_TOKEN");

        let pull_limit = bounded(
            &lookup,
            "OFFSYNC_SERVER_PULL_LIMIT",
            defaults.pull_limit,
            1..=10_000,
        )?;
        let max_push_entries = bounded(
            &lookup,
            "OFFSYNC_SERVER_MAX_PUSH_ENTRIES",
            defaults.max_push_entries,
            1..=10_000,
        )?;

        Ok(Self {
            bind_addr,
            token,
            pull_limit,
            max_push_entries,
        })
    }
}

fn bounded(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: usize,
    range: std::ops::RangeInclusive<usize>,
) -> Result<usize, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let value = raw.parse::<usize>().map_err(|_| {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    })?;
    if !range.contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{}, {}]",
            range.start(),
            range.end()
        )));
    }
    Ok(value)
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    offsync_core::util::normalize_text_option(lookup(name))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_map(map: &HashMap<&str, &str>) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_defaults_without_environment() {
        let config = from_map(&HashMap::new()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8787");
        assert_eq!(config.token, None);
        assert_eq!(config.pull_limit, 500);
    }

    #[test]
    fn config_rejects_out_of_range_limits() {
        let mut map = HashMap::new();
        map.insert("OFFSYNC_SERVER_PULL_LIMIT", "0");
        let err = from_map(&map).unwrap_err();
        assert!(err.to_string().contains("OFFSYNC_SERVER_PULL_LIMIT"));
    }

    #[test]
    fn config_redacts_token_in_debug() {
        let mut map = HashMap::new();
        map.insert("OFFSYNC_SERVER_TOKEN", "sensitive-shared-token");
        map.insert("OFFSYNC_SERVER_BIND_ADDR", "0.0.0.0:9000");

        let config = from_map(&map).unwrap();
        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-shared-token"));
        assert!(debug_output.contains("[REDACTED]"));
        assert!(debug_output.contains("0.0.0.0:9000"));
    }
}
