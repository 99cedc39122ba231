//! Sync conflict log model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// How a conflict ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Local payload was re-pushed over the server's
    LocalWins,
    /// Server record replaced the local one
    ServerWins,
    /// Escalated to the user
    Flagged,
    /// User kept the local payload
    ManualKeepLocal,
    /// User took the server record
    ManualKeepServer,
}

impl ConflictResolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalWins => "local_wins",
            Self::ServerWins => "server_wins",
            Self::Flagged => "flagged",
            Self::ManualKeepLocal => "manual_keep_local",
            Self::ManualKeepServer => "manual_keep_server",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictResolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local_wins" => Ok(Self::LocalWins),
            "server_wins" => Ok(Self::ServerWins),
            "flagged" => Ok(Self::Flagged),
            "manual_keep_local" => Ok(Self::ManualKeepLocal),
            "manual_keep_server" => Ok(Self::ManualKeepServer),
            other => Err(Error::InvalidInput(format!(
                "unknown conflict resolution '{other}'"
            ))),
        }
    }
}

/// Recorded sync conflict and how it was resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Record involved in the conflict
    pub entity_id: String,
    /// Base version the local mutation was made against
    pub local_version: i64,
    /// Server version at the time of the conflict
    pub server_version: i64,
    pub local_updated_at: i64,
    pub server_updated_at: i64,
    pub resolution: ConflictResolution,
    /// Resolution timestamp (unix ms)
    pub resolved_at: i64,
}
