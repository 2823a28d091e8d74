// ── Core error types ──
//
// User-facing errors from telemux-core. The `From<telemux_api::Error>`
// impl translates transport-layer failures into domain variants; RPC
// failures keep their HTTP status so callers can classify them.

use thiserror::Error;

use crate::rpc::RpcFailure;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to server at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Telemetry service stopped")]
    ServiceStopped,

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    // ── Operation errors ─────────────────────────────────────────────
    #[error("Rpc disabled!")]
    RpcDisabled,

    /// A device command failed; the failure carries its classification.
    #[error("{0}")]
    Rpc(RpcFailure),

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    // ── API errors (wrapped, not exposed raw) ────────────────────────
    #[error("API error: {message}")]
    Api {
        message: String,
        /// HTTP status code (if applicable).
        status: Option<u16>,
        /// Raw response body, kept for error-detail extraction.
        body: Option<String>,
    },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl CoreError {
    /// HTTP-style status for classification. Local timeouts count as 408.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Timeout { .. } => Some(408),
            Self::Rpc(failure) => Some(failure.status),
            Self::Api { status, .. } => *status,
            Self::AuthenticationFailed { .. } => Some(401),
            _ => None,
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<telemux_api::Error> for CoreError {
    fn from(err: telemux_api::Error) -> Self {
        match err {
            telemux_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            telemux_api::Error::SessionExpired => CoreError::AuthenticationFailed {
                message: "Session expired -- re-authentication required".into(),
            },
            telemux_api::Error::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout { timeout_ms: 0 }
                } else if e.is_connect() {
                    CoreError::ConnectionFailed {
                        url: e.url().map(ToString::to_string).unwrap_or_else(|| "<unknown>".into()),
                        reason: e.to_string(),
                    }
                } else {
                    CoreError::Api {
                        message: e.to_string(),
                        status: e.status().map(|s| s.as_u16()),
                        body: None,
                    }
                }
            }
            telemux_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            telemux_api::Error::Timeout { timeout_ms } => CoreError::Timeout { timeout_ms },
            telemux_api::Error::Tls(msg) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("TLS error: {msg}"),
            },
            telemux_api::Error::Http {
                status,
                status_text,
                body,
            } => CoreError::Api {
                message: format!("{status} {status_text}"),
                status: Some(status),
                body: Some(body),
            },
            telemux_api::Error::WebSocketConnect(reason) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket: {reason}"),
            },
            telemux_api::Error::WebSocketClosed { code, reason } => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket closed (code {code}): {reason}"),
            },
            telemux_api::Error::Deserialization { message, body: _ } => CoreError::Api {
                message: format!("Deserialization error: {message}"),
                status: None,
                body: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_errors_keep_status_and_body() {
        let err: CoreError = telemux_api::Error::Http {
            status: 409,
            status_text: "Conflict".into(),
            body: "offline".into(),
        }
        .into();
        assert_eq!(err.status(), Some(409));
        assert!(matches!(err, CoreError::Api { body: Some(ref b), .. } if b == "offline"));
    }

    #[test]
    fn session_expiry_is_an_auth_failure() {
        let err: CoreError = telemux_api::Error::SessionExpired.into();
        assert!(matches!(err, CoreError::AuthenticationFailed { .. }));
    }
}
