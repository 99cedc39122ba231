use std::path::Path;

use offsync_core::RecordId;
use serde::Serialize;

use crate::config_profiles::{normalize_text_option, CliProfile, CliProfilesConfig};
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct ProfileView<'a> {
    profile: &'a str,
    active: bool,
    server_url: Option<String>,
    token_set: bool,
    origin_id: Option<String>,
}

fn load(config_path: &Path) -> Result<CliProfilesConfig, CliError> {
    CliProfilesConfig::load_from_path(config_path).map_err(CliError::Config)
}

fn save(config: &CliProfilesConfig, config_path: &Path) -> Result<(), CliError> {
    config.save_to_path(config_path).map_err(CliError::Config)
}

/// Fresh origin ids are time-ordered so two devices never collide.
pub fn generate_origin_id() -> String {
    format!("cli-{}", RecordId::new())
}

pub fn run_config_init(profile_name: &str, config_path: &Path) -> Result<CliProfile, CliError> {
    let mut config = load(config_path)?;
    let profile = config.profile_mut_or_default(profile_name);
    if profile.origin_id().is_none() {
        profile.origin_id = Some(generate_origin_id());
    }
    let profile = profile.clone();
    if config.active_profile.is_none() {
        config.active_profile = Some(profile_name.to_string());
    }
    save(&config, config_path)?;

    println!(
        "Profile '{profile_name}' ready at {} (origin {})",
        config_path.display(),
        profile.origin_id.as_deref().unwrap_or_default()
    );
    Ok(profile)
}

pub fn run_config_show(
    profile_name: &str,
    as_json: bool,
    config_path: &Path,
) -> Result<(), CliError> {
    let config = load(config_path)?;
    let profile = config.profile(profile_name).cloned().unwrap_or_default();
    let view = ProfileView {
        profile: profile_name,
        active: config.active_profile.as_deref() == Some(profile_name),
        server_url: profile.server_url(),
        token_set: profile.token().is_some(),
        origin_id: profile.origin_id(),
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!("Profile:   {}{}", view.profile, if view.active { " (active)" } else { "" });
    println!(
        "Server:    {}",
        view.server_url.as_deref().unwrap_or("(not set)")
    );
    println!("Token:     {}", if view.token_set { "set" } else { "(not set)" });
    println!(
        "Origin:    {}",
        view.origin_id.as_deref().unwrap_or("(not set)")
    );
    Ok(())
}

pub fn run_config_set(
    profile_name: &str,
    server_url: Option<String>,
    token: Option<String>,
    origin_id: Option<String>,
    config_path: &Path,
) -> Result<CliProfile, CliError> {
    if server_url.is_none() && token.is_none() && origin_id.is_none() {
        return Err(CliError::Config(
            "nothing to set; pass --server-url, --token or --origin-id".to_string(),
        ));
    }
    let server_url = normalize_text_option(server_url);
    if let Some(url) = &server_url {
        if !offsync_core::util::is_http_url(url) {
            return Err(CliError::Config(format!(
                "server URL must start with http:// or https://, got {url}"
            )));
        }
    }

    let mut config = load(config_path)?;
    let profile = config.profile_mut_or_default(profile_name);
    if server_url.is_some() {
        profile.server_url = server_url;
    }
    if let Some(token) = token {
        profile.token = Some(token);
    }
    if let Some(origin_id) = origin_id {
        profile.origin_id = Some(origin_id);
    }
    save(&config, config_path)?;

    // Reload so the caller sees the normalized values that were written
    let profile = load(config_path)?
        .profile(profile_name)
        .cloned()
        .unwrap_or_default();
    println!("Updated profile '{profile_name}'");
    Ok(profile)
}

pub fn run_config_use(name: &str, config_path: &Path) -> Result<(), CliError> {
    let mut config = load(config_path)?;
    if config.profile(name).is_none() {
        return Err(CliError::Config(format!(
            "profile '{name}' does not exist; run `offsync --profile {name} config init` first"
        )));
    }
    config.active_profile = Some(name.to_string());
    save(&config, config_path)?;
    println!("Active profile is now '{name}'");
    Ok(())
}
