//! offsync CLI - edit records offline and sync them with an offsync server

mod cli;
mod commands;
mod config_profiles;
mod error;


use clap::Parser;

use crate::cli::{Cli, Commands, ConfigCommands};
use crate::commands::common::{resolve_db_path, CliContext};
use crate::commands::config::{run_config_init, run_config_set, run_config_show, run_config_use};
use crate::commands::records::{run_create, run_delete, run_get, run_list, run_update};
use crate::commands::repair::{
    run_conflicts, run_discard, run_history, run_outbox, run_resolve, run_retry,
};
use crate::commands::sync::{run_daemon, run_status, run_sync};
use crate::config_profiles::{default_config_path, CliProfilesConfig};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(
                    "offsync_core=warn"
                        .parse()
                        .map_err(|error| CliError::Config(format!("{error}")))?,
                ),
        )
        .init();

    let cli = Cli::parse();
    let config_path = default_config_path().map_err(CliError::Config)?;
    let profiles = CliProfilesConfig::load_from_path(&config_path).map_err(CliError::Config)?;
    let profile_name = profiles.resolve_profile_name(cli.profile.as_deref());

    if let Commands::Config { command } = &cli.command {
        return match command {
            ConfigCommands::Init => run_config_init(&profile_name, &config_path).map(|_| ()),
            ConfigCommands::Show { json } => run_config_show(&profile_name, *json, &config_path),
            ConfigCommands::Set {
                server_url,
                token,
                origin_id,
            } => run_config_set(
                &profile_name,
                server_url.clone(),
                token.clone(),
                origin_id.clone(),
                &config_path,
            )
            .map(|_| ()),
            ConfigCommands::Use { name } => run_config_use(name, &config_path),
        };
    }

    let profile = profiles.profile(&profile_name).cloned().unwrap_or_default();
    let ctx = CliContext::new(resolve_db_path(cli.db_path)?, profile_name, profile)?;

    match cli.command {
        Commands::Create { payload } => {
            run_create(payload.as_deref(), &ctx)?;
        }
        Commands::Update { id, payload } => {
            run_update(&id, payload.as_deref(), &ctx)?;
        }
        Commands::Delete { id } => run_delete(&id, &ctx)?,
        Commands::Get { id, json } => run_get(&id, json, &ctx)?,
        Commands::List { limit, json } => run_list(limit, json, &ctx)?,
        Commands::Sync { target } => {
            run_sync(&target, &ctx).await?;
        }
        Commands::Daemon { target, interval } => run_daemon(&target, interval, &ctx).await?,
        Commands::Status { json } => run_status(json, &ctx)?,
        Commands::Outbox {
            status,
            limit,
            json,
        } => run_outbox(status.map(Into::into), limit, json, &ctx)?,
        Commands::Conflicts { limit, json } => run_conflicts(limit, json, &ctx)?,
        Commands::History { limit, json } => run_history(limit, json, &ctx)?,
        Commands::Resolve { id, keep } => run_resolve(&id, keep.into(), &ctx)?,
        Commands::Retry { id } => {
            run_retry(&id, &ctx)?;
        }
        Commands::Discard { id } => {
            run_discard(&id, &ctx)?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}
