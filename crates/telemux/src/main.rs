mod cli;
mod commands;
mod error;
mod output;

use clap::Parser;
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

use telemux_config::{Config, Profile, SystemSecrets};
use telemux_core::{AuthCredentials, ServiceConfig};

use crate::cli::{Cli, Command, GlobalOpts};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.global.verbose);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        // Config commands don't need a server
        Command::Config(args) => commands::config_cmd::handle(&args, &cli.global),

        cmd => {
            let config = build_service_config(&cli.global)?;
            tracing::debug!(command = ?cmd, server = %config.url, "dispatching command");
            commands::dispatch(cmd, &config, &cli.global).await
        }
    }
}

/// Build a `ServiceConfig` from the config file, profile, and CLI overrides.
fn build_service_config(global: &GlobalOpts) -> Result<ServiceConfig, CliError> {
    let cfg = telemux_config::load_config_or_default();
    let profile_name = global
        .profile
        .clone()
        .or_else(|| cfg.default_profile.clone())
        .unwrap_or_else(|| "default".into());

    let profile = match cfg.profiles.get(&profile_name) {
        Some(profile) => apply_overrides(profile.clone(), global),
        None if global.profile.is_some() => {
            return Err(profile_not_found(&cfg, profile_name));
        }
        // No profile -- build from flags / env alone
        None => {
            let server = global.server.clone().ok_or_else(|| CliError::NoConfig {
                path: telemux_config::config_path().display().to_string(),
            })?;
            apply_overrides(
                Profile {
                    server,
                    ..Profile::default()
                },
                global,
            )
        }
    };

    // An explicit token beats anything the profile resolves to
    let config = match &global.token {
        Some(token) => telemux_config::service_config_with_auth(
            &profile,
            &cfg.defaults,
            AuthCredentials::Token(SecretString::from(token.clone())),
        )?,
        None => telemux_config::profile_to_service_config(
            &profile,
            &profile_name,
            &cfg.defaults,
            &SystemSecrets,
        )?,
    };
    Ok(config)
}

fn apply_overrides(mut profile: Profile, global: &GlobalOpts) -> Profile {
    if let Some(ref server) = global.server {
        profile.server.clone_from(server);
    }
    if global.insecure {
        profile.insecure = Some(true);
    }
    if global.timeout.is_some() {
        profile.timeout = global.timeout;
    }
    profile
}

fn profile_not_found(cfg: &Config, name: String) -> CliError {
    let mut available: Vec<&str> = cfg.profiles.keys().map(String::as_str).collect();
    available.sort_unstable();
    CliError::ProfileNotFound {
        name,
        available: if available.is_empty() {
            "(none)".into()
        } else {
            available.join(", ")
        },
        path: telemux_config::config_path().display().to_string(),
    }
}
