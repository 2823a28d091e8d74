//! Config subcommand handlers.

use telemux_config::Config;

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts, OutputFormat};
use crate::error::CliError;
use crate::output;

const REDACTED: &str = "********";

pub fn handle(args: &ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let rendered = match args.command {
        ConfigCommand::Path => telemux_config::config_path().display().to_string(),
        ConfigCommand::Show => {
            let cfg = redacted(telemux_config::load_config()?);
            render_config(global.output, &cfg)?
        }
        ConfigCommand::Profiles => {
            let cfg = telemux_config::load_config()?;
            profile_list(&cfg)
        }
    };
    output::print_output(&rendered, global.quiet);
    Ok(())
}

/// Copy of `cfg` with plaintext secrets masked.
fn redacted(mut cfg: Config) -> Config {
    for profile in cfg.profiles.values_mut() {
        if profile.password.is_some() {
            profile.password = Some(REDACTED.into());
        }
        if profile.token.is_some() {
            profile.token = Some(REDACTED.into());
        }
    }
    cfg
}

fn render_config(format: OutputFormat, cfg: &Config) -> Result<String, CliError> {
    match format {
        OutputFormat::Json | OutputFormat::JsonCompact => {
            Ok(output::render_value(format, &serde_json::to_value(cfg)?))
        }
        OutputFormat::Table | OutputFormat::Plain => {
            toml::to_string_pretty(cfg).map_err(|e| CliError::Validation {
                field: "config".into(),
                reason: format!("failed to serialize config: {e}"),
            })
        }
    }
}

/// Sorted profile names, the default one marked with `*`.
fn profile_list(cfg: &Config) -> String {
    let mut names: Vec<&String> = cfg.profiles.keys().collect();
    names.sort_unstable();
    names
        .into_iter()
        .map(|name| {
            if cfg.default_profile.as_ref() == Some(name) {
                format!("* {name}")
            } else {
                format!("  {name}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
