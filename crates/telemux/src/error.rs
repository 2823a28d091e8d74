//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and stable exit codes.

use miette::Diagnostic;
use thiserror::Error;

use telemux_config::ConfigError;
use telemux_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const OFFLINE: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not connect to server at {url}: {reason}")]
    #[diagnostic(
        code(telemux::connection_failed),
        help(
            "Check that the server is running and reachable.\n\
             URL: {url}\n\
             Self-signed certificate? Try --insecure (-k)."
        )
    )]
    ConnectionFailed { url: String, reason: String },

    #[error("Telemetry connection closed before any data arrived")]
    #[diagnostic(code(telemux::disconnected), help("Run with -v to see connection errors."))]
    Disconnected,

    // ── Authentication ───────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(telemux::auth_failed),
        help("Verify the token or username/password for profile '{profile}'.")
    )]
    AuthFailed { profile: String, message: String },

    #[error("No credentials configured for profile '{profile}'")]
    #[diagnostic(
        code(telemux::no_credentials),
        help(
            "Set token, token_env or username/password in the profile,\n\
             or pass --token / set TELEMUX_TOKEN."
        )
    )]
    NoCredentials { profile: String },

    // ── RPC ──────────────────────────────────────────────────────────
    #[error("{message}")]
    #[diagnostic(code(telemux::rpc_failed))]
    Rpc { status: u16, message: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(telemux::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(telemux::profile_not_found),
        help(
            "Available profiles: {available}\n\
             Config file: {path}"
        )
    )]
    ProfileNotFound {
        name: String,
        available: String,
        path: String,
    },

    #[error("No server configured")]
    #[diagnostic(
        code(telemux::no_config),
        help(
            "Pass --server and --token, or add a profile to\n\
             {path}"
        )
    )]
    NoConfig { path: String },

    #[error(transparent)]
    #[diagnostic(code(telemux::config))]
    Config(ConfigError),

    // ── Timeout ──────────────────────────────────────────────────────
    #[error("No data within {waited}")]
    #[diagnostic(
        code(telemux::timeout),
        help("Increase --wait or check that the entity reports these keys.")
    )]
    Timeout { waited: String },

    // ── API / IO ─────────────────────────────────────────────────────
    #[error("API error: {message}")]
    #[diagnostic(code(telemux::api_error))]
    Api { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    #[diagnostic(code(telemux::json))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::Disconnected => exit_code::CONNECTION,
            Self::AuthFailed { .. } | Self::NoCredentials { .. } => exit_code::AUTH,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Rpc { status, .. } => match *status {
                408 => exit_code::TIMEOUT,
                409 => exit_code::OFFLINE,
                _ => exit_code::GENERAL,
            },
            Self::Validation { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConnectionFailed { url, reason } => CliError::ConnectionFailed { url, reason },

            CoreError::AuthenticationFailed { message } => CliError::AuthFailed {
                profile: "current".into(),
                message,
            },

            CoreError::ServiceStopped => CliError::Disconnected,

            CoreError::Timeout { timeout_ms } => CliError::Timeout {
                waited: humantime::format_duration(std::time::Duration::from_millis(timeout_ms))
                    .to_string(),
            },

            CoreError::RpcDisabled => CliError::Validation {
                field: "device".into(),
                reason: "no target device for RPC".into(),
            },

            CoreError::Rpc(failure) => CliError::Rpc {
                status: failure.status,
                message: failure.message,
            },

            CoreError::ValidationFailed { message } => CliError::Validation {
                field: "input".into(),
                reason: message,
            },

            CoreError::Api { message, .. } => CliError::Api { message },

            CoreError::Config { message } => CliError::Validation {
                field: "config".into(),
                reason: message,
            },
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NoCredentials { profile } => CliError::NoCredentials { profile },
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            other => CliError::Config(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemux_core::RpcFailure;

    #[test]
    fn rpc_failures_map_to_distinct_exit_codes() {
        let timeout: CliError = CoreError::Rpc(RpcFailure::timeout()).into();
        assert_eq!(timeout.exit_code(), exit_code::TIMEOUT);
        assert_eq!(timeout.to_string(), "Request Timeout.");

        let offline: CliError =
            CoreError::Rpc(RpcFailure::classify(409, "Conflict", None)).into();
        assert_eq!(offline.exit_code(), exit_code::OFFLINE);

        let other: CliError =
            CoreError::Rpc(RpcFailure::classify(500, "Internal Server Error", None)).into();
        assert_eq!(other.exit_code(), exit_code::GENERAL);
    }

    #[test]
    fn config_errors_keep_their_kind() {
        let err: CliError = ConfigError::NoCredentials {
            profile: "lab".into(),
        }
        .into();
        assert!(matches!(err, CliError::NoCredentials { ref profile } if profile == "lab"));
        assert_eq!(err.exit_code(), exit_code::AUTH);
    }
}
