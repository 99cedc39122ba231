use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use offsync_core::services::ManualResolution;
use offsync_core::EntryStatus;

#[derive(Parser)]
#[command(name = "offsync")]
#[command(about = "Edit records offline and sync them when the server is reachable")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// CLI profile holding server and origin settings
    #[arg(long, global = true, value_name = "NAME")]
    pub profile: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a record from a JSON payload (read from stdin when omitted)
    #[command(alias = "new")]
    Create {
        /// JSON payload
        payload: Option<String>,
    },
    /// Replace a record's payload
    Update {
        /// Record ID
        id: String,
        /// JSON payload (read from stdin when omitted)
        payload: Option<String>,
    },
    /// Delete a record
    #[command(alias = "rm")]
    Delete {
        /// Record ID
        id: String,
    },
    /// Show one record
    Get {
        /// Record ID
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List records that are not deleted
    List {
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one sync round against the server
    Sync {
        #[command(flatten)]
        target: SyncTargetArgs,
    },
    /// Keep syncing on a timer until interrupted
    Daemon {
        #[command(flatten)]
        target: SyncTargetArgs,
        /// Seconds between timer rounds
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
    },
    /// Show sync state, watermark and outbox counts
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List outbox entries
    Outbox {
        /// Only entries in this state
        #[arg(long, value_enum)]
        status: Option<EntryStatusArg>,
        /// Number of entries to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List conflicts waiting for a decision
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show how past conflicts were resolved
    History {
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Settle a flagged conflict
    Resolve {
        /// Record ID
        id: String,
        /// Which side to keep
        #[arg(long, value_enum)]
        keep: KeepSide,
    },
    /// Queue failed changes of a record again
    Retry {
        /// Record ID
        id: String,
    },
    /// Drop failed changes of a record
    Discard {
        /// Record ID
        id: String,
    },
    /// Manage CLI profiles
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct SyncTargetArgs {
    /// Server base URL (overrides profile and OFFSYNC_SERVER_URL)
    #[arg(long, value_name = "URL")]
    pub server: Option<String>,
    /// Bearer token (overrides profile and OFFSYNC_TOKEN)
    #[arg(long, value_name = "TOKEN")]
    pub token: Option<String>,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Create the profile and give it an origin id if it has none
    Init,
    /// Print the resolved profile
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change profile settings
    Set {
        #[arg(long, value_name = "URL")]
        server_url: Option<String>,
        #[arg(long, value_name = "TOKEN")]
        token: Option<String>,
        #[arg(long, value_name = "ID")]
        origin_id: Option<String>,
    },
    /// Make a profile the default
    Use {
        /// Profile name
        name: String,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KeepSide {
    Local,
    Server,
}

impl From<KeepSide> for ManualResolution {
    fn from(side: KeepSide) -> Self {
        match side {
            KeepSide::Local => Self::KeepLocal,
            KeepSide::Server => Self::KeepServer,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum EntryStatusArg {
    Pending,
    InFlight,
    Conflict,
    Failed,
}

impl From<EntryStatusArg> for EntryStatus {
    fn from(status: EntryStatusArg) -> Self {
        match status {
            EntryStatusArg::Pending => Self::Pending,
            EntryStatusArg::InFlight => Self::InFlight,
            EntryStatusArg::Conflict => Self::Conflict,
            EntryStatusArg::Failed => Self::Failed,
        }
    }
}
