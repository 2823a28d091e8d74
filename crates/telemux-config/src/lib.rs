//! Configuration profiles for telemux.
//!
//! Profiles live in a TOML file under the platform config directory and
//! can be overridden with `TELEMUX_` environment variables (nested keys
//! separated by `__`, e.g. `TELEMUX_DEFAULTS__TIMEOUT=10`). Secrets resolve
//! env var → OS keyring → plaintext profile value.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::debug;

use telemux_core::{AuthCredentials, MuxSettings, ServiceConfig, TlsVerification};

const APP: &str = "telemux";

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for '{field}': {reason}")]
    Validation { field: String, reason: String },

    #[error("no credentials configured for profile '{profile}'")]
    NoCredentials { profile: String },

    #[error("profile '{name}' not found")]
    ProfileNotFound { name: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config error: {0}")]
    Figment(Box<figment::Error>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── Types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub default_profile: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub insecure: bool,

    /// REST timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            insecure: false,
            timeout: default_timeout(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}

/// One server endpoint and how to authenticate against it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    /// Server base URL (`http://host:port` or `https://host`).
    pub server: String,

    /// Login user for username/password auth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Plaintext password (prefer keyring or `password_env`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Environment variable holding the password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    /// Pre-issued JWT. Takes precedence over username/password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Environment variable holding the JWT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,

    /// Custom CA certificate (PEM).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,

    /// REST timeout in seconds, overriding `defaults.timeout`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_delay_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,

    /// Assumed access-token lifetime in seconds for username/password auth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_lifetime_secs: Option<u64>,
}

impl Config {
    /// Look up `name`, or the default profile when `name` is `None`.
    pub fn profile(&self, name: Option<&str>) -> Result<(&str, &Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or("default");
        self.profiles
            .get_key_value(name)
            .map(|(k, p)| (k.as_str(), p))
            .ok_or_else(|| ConfigError::ProfileNotFound {
                name: name.to_owned(),
            })
    }
}

// ── Loading / saving ────────────────────────────────────────────────

/// Canonical config file path.
pub fn config_path() -> PathBuf {
    directories::ProjectDirs::from("io", APP, APP).map_or_else(
        || {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            PathBuf::from(home)
                .join(".config")
                .join(APP)
                .join("config.toml")
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Load from the canonical path with env overrides.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` with env overrides. A missing file yields defaults.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    debug!(path = %path.display(), "loading config");
    let config: Config = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("TELEMUX_").split("__"))
        .extract()?;
    Ok(config)
}

/// Load config, falling back to defaults on error.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

/// Write `config` to `path`, creating parent directories.
pub fn save_config_to(config: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(config)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Credential resolution ───────────────────────────────────────────

/// Where secrets come from besides the profile itself.
pub trait SecretSource {
    fn env(&self, name: &str) -> Option<String>;
    /// Look up `account` (e.g. `prod/token`) in the OS keyring.
    fn keyring(&self, account: &str) -> Option<String>;
}

/// Process environment plus the OS keyring.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSecrets;

impl SecretSource for SystemSecrets {
    fn env(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn keyring(&self, account: &str) -> Option<String> {
        keyring::Entry::new(APP, account)
            .and_then(|entry| entry.get_password())
            .ok()
    }
}

fn lookup(
    source: &dyn SecretSource,
    env_name: Option<&str>,
    account: &str,
    plaintext: Option<&str>,
) -> Option<SecretString> {
    if let Some(value) = env_name.and_then(|name| source.env(name)) {
        return Some(SecretString::from(value));
    }
    if let Some(value) = source.keyring(account) {
        return Some(SecretString::from(value));
    }
    plaintext.map(|p| SecretString::from(p.to_owned()))
}

/// Resolve how `profile` authenticates: a token wins over username/password.
pub fn resolve_auth(
    profile: &Profile,
    profile_name: &str,
    source: &dyn SecretSource,
) -> Result<AuthCredentials, ConfigError> {
    let token = lookup(
        source,
        profile.token_env.as_deref(),
        &format!("{profile_name}/token"),
        profile.token.as_deref(),
    );
    if let Some(token) = token {
        return Ok(AuthCredentials::Token(token));
    }

    let username = profile
        .username
        .clone()
        .ok_or_else(|| ConfigError::NoCredentials {
            profile: profile_name.into(),
        })?;
    let password = lookup(
        source,
        profile.password_env.as_deref(),
        &format!("{profile_name}/password"),
        profile.password.as_deref(),
    )
    .ok_or_else(|| ConfigError::NoCredentials {
        profile: profile_name.into(),
    })?;

    Ok(AuthCredentials::Credentials { username, password })
}

// ── Translation to runtime config ───────────────────────────────────

/// Build a [`ServiceConfig`] from a profile, resolving its credentials.
pub fn profile_to_service_config(
    profile: &Profile,
    profile_name: &str,
    defaults: &Defaults,
    source: &dyn SecretSource,
) -> Result<ServiceConfig, ConfigError> {
    let auth = resolve_auth(profile, profile_name, source)?;
    service_config_with_auth(profile, defaults, auth)
}

/// Build a [`ServiceConfig`] from a profile with already-resolved credentials.
pub fn service_config_with_auth(
    profile: &Profile,
    defaults: &Defaults,
    auth: AuthCredentials,
) -> Result<ServiceConfig, ConfigError> {
    let url: url::Url = profile
        .server
        .parse()
        .map_err(|e: url::ParseError| ConfigError::Validation {
            field: "server".into(),
            reason: e.to_string(),
        })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Validation {
            field: "server".into(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }

    let mut config = ServiceConfig::new(url, auth);

    config.tls = if profile.insecure.unwrap_or(defaults.insecure) {
        TlsVerification::DangerAcceptInvalid
    } else if let Some(ref ca) = profile.ca_cert {
        TlsVerification::CustomCa(ca.clone())
    } else {
        TlsVerification::SystemDefaults
    };
    config.timeout = Duration::from_secs(profile.timeout.unwrap_or(defaults.timeout));

    let mux_defaults = MuxSettings::default();
    config.mux = MuxSettings {
        reconnect_delay: profile
            .reconnect_delay_ms
            .map_or(mux_defaults.reconnect_delay, Duration::from_millis),
        idle_timeout: profile
            .idle_timeout_ms
            .map_or(mux_defaults.idle_timeout, Duration::from_millis),
        ..mux_defaults
    };
    if let Some(secs) = profile.token_lifetime_secs {
        config.token_lifetime = Duration::from_secs(secs);
    }

    Ok(config)
}
