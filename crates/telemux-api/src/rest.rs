// REST client for the auth and RPC endpoints.
//
// The telemetry stream itself runs over the websocket; REST is only used
// to obtain and refresh JWTs and to send RPC commands to devices.

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::auth::{JwtPair, LoginRequest, RefreshRequest};
use crate::error::Error;
use crate::transport::TransportConfig;

const AUTH_HEADER: &str = "X-Authorization";

/// HTTP client bound to one server.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
}

impl RestClient {
    pub fn new(base_url: Url, transport: &TransportConfig) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Ok(Self { http, base_url })
    }

    /// Create a client with a pre-built `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn api_url(&self, path: &str) -> Result<Url, Error> {
        Ok(self.base_url.join(path)?)
    }

    // ── Auth ─────────────────────────────────────────────────────────

    /// Exchange username and password for a token pair.
    pub async fn login(&self, username: &str, password: &SecretString) -> Result<JwtPair, Error> {
        let url = self.api_url("/api/auth/login")?;
        debug!("POST {}", url);

        let resp = self
            .http
            .post(url)
            .json(&LoginRequest { username, password })
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Authentication {
                message: error_detail(&body),
            });
        }
        parse_json(resp).await
    }

    /// Trade a refresh token for a new pair.
    pub async fn refresh_token(&self, refresh_token: &SecretString) -> Result<JwtPair, Error> {
        let url = self.api_url("/api/auth/token")?;
        debug!("POST {}", url);

        let resp = self
            .http
            .post(url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::SessionExpired);
        }
        parse_json(resp).await
    }

    // ── RPC ──────────────────────────────────────────────────────────

    /// Send an RPC request to a device.
    ///
    /// One-way requests usually answer with an empty body, which maps to
    /// `Value::Null`. Non-JSON bodies come back as a JSON string.
    pub async fn send_rpc(
        &self,
        token: &SecretString,
        device_id: Uuid,
        one_way: bool,
        body: &impl Serialize,
    ) -> Result<serde_json::Value, Error> {
        let kind = if one_way { "oneway" } else { "twoway" };
        let url = self.api_url(&format!("/api/plugins/rpc/{kind}/{device_id}"))?;
        debug!("POST {}", url);

        let resp = self
            .http
            .post(url)
            .header(AUTH_HEADER, format!("Bearer {}", token.expose_secret()))
            .json(body)
            .send()
            .await?;

        let text = checked_body(resp).await?;
        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
    }
}

// ── Response helpers ─────────────────────────────────────────────────

/// Read the body, turning any non-success status into `Error::Http`.
async fn checked_body(resp: reqwest::Response) -> Result<String, Error> {
    let status = resp.status();
    let body = resp.text().await?;
    if status.is_success() {
        Ok(body)
    } else {
        Err(Error::Http {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            body,
        })
    }
}

async fn parse_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let body = checked_body(resp).await?;
    serde_json::from_str(&body).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body,
    })
}

/// Human-readable detail from an error response body.
///
/// Prefers a JSON `message` field and falls back to the raw text.
pub fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_owned))
        .unwrap_or_else(|| body.to_owned())
}
