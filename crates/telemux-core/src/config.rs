// ── Runtime service configuration ──
//
// These types describe how to reach the server and how the multiplexer
// behaves. They carry credential data but never touch disk; the CLI
// builds a `ServiceConfig` and hands it in.

use std::time::Duration;

use secrecy::SecretString;
use url::Url;

/// How to authenticate with the server.
#[derive(Debug, Clone)]
pub enum AuthCredentials {
    /// Pre-issued JWT, used as-is until it is rejected.
    Token(SecretString),
    /// Username/password login with refresh-token renewal.
    Credentials {
        username: String,
        password: SecretString,
    },
}

/// TLS verification strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsVerification {
    /// System CA store (strict).
    #[default]
    SystemDefaults,
    /// Custom CA certificate file.
    CustomCa(std::path::PathBuf),
    /// Skip verification (self-signed certs).
    DangerAcceptInvalid,
}

/// Multiplexer timing and batching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxSettings {
    /// Delay between reconnect attempts. Fixed, no backoff.
    pub reconnect_delay: Duration,
    /// How long an idle connection (no subscribers) stays open.
    pub idle_timeout: Duration,
    /// Cap on commands per outbound frame.
    pub max_publish_commands: usize,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(2_000),
            idle_timeout: Duration::from_millis(90_000),
            max_publish_commands: telemux_api::telemetry::MAX_PUBLISH_COMMANDS,
        }
    }
}

/// Everything needed to run a telemetry session against one server.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Server base URL (e.g., `https://iot.example.com`).
    pub url: Url,
    pub auth: AuthCredentials,
    pub tls: TlsVerification,
    /// REST request timeout.
    pub timeout: Duration,
    pub mux: MuxSettings,
    /// Assumed validity of a freshly issued access token.
    pub token_lifetime: Duration,
}

impl ServiceConfig {
    pub fn new(url: Url, auth: AuthCredentials) -> Self {
        Self {
            url,
            auth,
            tls: TlsVerification::default(),
            timeout: Duration::from_secs(30),
            mux: MuxSettings::default(),
            token_lifetime: Duration::from_secs(9_000),
        }
    }

    pub fn transport(&self) -> telemux_api::TransportConfig {
        let tls = match &self.tls {
            TlsVerification::SystemDefaults => telemux_api::TlsMode::System,
            TlsVerification::CustomCa(path) => telemux_api::TlsMode::CustomCa(path.clone()),
            TlsVerification::DangerAcceptInvalid => telemux_api::TlsMode::DangerAcceptInvalid,
        };
        telemux_api::TransportConfig {
            tls,
            timeout: self.timeout,
        }
    }
}
