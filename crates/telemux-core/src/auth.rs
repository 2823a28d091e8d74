// ── Auth providers ──
//
// The multiplexer asks for a token right before opening a socket. An
// expired token is refreshed first; if that fails the provider is logged
// out and the connection attempt is abandoned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use secrecy::SecretString;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use telemux_api::RestClient;

use crate::error::CoreError;

/// Source of bearer tokens for the telemetry socket and RPC calls.
pub trait AuthProvider: Send + Sync {
    fn is_token_valid(&self) -> bool;
    /// Current access token, if any.
    fn token(&self) -> Option<SecretString>;
    /// Obtain a fresh access token.
    fn refresh_token(&self) -> BoxFuture<'_, Result<SecretString, CoreError>>;
    fn logout(&self);
}

/// The current token if still valid, otherwise a refreshed one.
pub async fn current_token(auth: &dyn AuthProvider) -> Result<SecretString, CoreError> {
    if auth.is_token_valid() {
        if let Some(token) = auth.token() {
            return Ok(token);
        }
    }
    debug!("token expired, refreshing");
    auth.refresh_token().await
}

// ── StaticTokenAuth ──────────────────────────────────────────────────

/// A token supplied up front. It cannot be refreshed.
#[derive(Debug)]
pub struct StaticTokenAuth {
    token: SecretString,
    revoked: AtomicBool,
}

impl StaticTokenAuth {
    pub fn new(token: SecretString) -> Self {
        Self {
            token,
            revoked: AtomicBool::new(false),
        }
    }
}

impl AuthProvider for StaticTokenAuth {
    fn is_token_valid(&self) -> bool {
        !self.revoked.load(Ordering::Acquire)
    }

    fn token(&self) -> Option<SecretString> {
        self.is_token_valid().then(|| self.token.clone())
    }

    fn refresh_token(&self) -> BoxFuture<'_, Result<SecretString, CoreError>> {
        Box::pin(async move {
            self.token().ok_or_else(|| CoreError::AuthenticationFailed {
                message: "static token was revoked and cannot be refreshed".into(),
            })
        })
    }

    fn logout(&self) {
        self.revoked.store(true, Ordering::Release);
    }
}

// ── JwtSessionAuth ───────────────────────────────────────────────────

struct Session {
    token: SecretString,
    refresh_token: SecretString,
    expires_at: Instant,
}

/// Username/password session with refresh-token renewal.
///
/// Tokens are treated as valid for `lifetime` after issue.
pub struct JwtSessionAuth {
    rest: RestClient,
    username: String,
    password: SecretString,
    lifetime: Duration,
    session: Mutex<Option<Session>>,
}

impl std::fmt::Debug for JwtSessionAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSessionAuth")
            .field("username", &self.username)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

impl JwtSessionAuth {
    pub fn new(rest: RestClient, username: String, password: SecretString, lifetime: Duration) -> Self {
        Self {
            rest,
            username,
            password,
            lifetime,
            session: Mutex::new(None),
        }
    }

    /// Log in with the stored credentials and keep the issued pair.
    pub async fn login(&self) -> Result<SecretString, CoreError> {
        let pair = self.rest.login(&self.username, &self.password).await?;
        info!(username = %self.username, "logged in");
        Ok(self.store(pair))
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    fn store(&self, pair: telemux_api::auth::JwtPair) -> SecretString {
        let token = pair.token.clone();
        *self.lock() = Some(Session {
            token: pair.token,
            refresh_token: pair.refresh_token,
            expires_at: Instant::now() + self.lifetime,
        });
        token
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AuthProvider for JwtSessionAuth {
    fn is_token_valid(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|s| s.expires_at > Instant::now())
    }

    fn token(&self) -> Option<SecretString> {
        self.lock().as_ref().map(|s| s.token.clone())
    }

    fn refresh_token(&self) -> BoxFuture<'_, Result<SecretString, CoreError>> {
        Box::pin(async move {
            let refresh = self.lock().as_ref().map(|s| s.refresh_token.clone());
            let Some(refresh) = refresh else {
                return self.login().await;
            };
            match self.rest.refresh_token(&refresh).await {
                Ok(pair) => {
                    debug!("access token refreshed");
                    Ok(self.store(pair))
                }
                Err(e) if e.is_auth_expired() => {
                    warn!(error = %e, "refresh token rejected, logging in again");
                    self.login().await
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    fn logout(&self) {
        *self.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn static_token_stops_after_logout() {
        let auth = StaticTokenAuth::new(SecretString::from("abc".to_string()));
        assert!(auth.is_token_valid());
        assert_eq!(auth.token().unwrap().expose_secret(), "abc");

        auth.logout();
        assert!(!auth.is_token_valid());
        assert!(auth.refresh_token().await.is_err());
    }

    #[tokio::test]
    async fn session_logs_in_when_no_refresh_token_is_held() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "token": "t1", "refreshToken": "r1" })),
            )
            .mount(&server)
            .await;

        let rest = rest_client(&server);
        let auth = JwtSessionAuth::new(
            rest,
            "user".into(),
            SecretString::from("pw".to_string()),
            Duration::from_secs(60),
        );

        assert!(!auth.is_token_valid());
        let token = auth.refresh_token().await.unwrap();
        assert_eq!(token.expose_secret(), "t1");
        assert!(auth.is_token_valid());

        auth.logout();
        assert!(auth.token().is_none());
    }

    #[tokio::test]
    async fn session_uses_refresh_endpoint_when_possible() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "token": "t1", "refreshToken": "r1" })),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "token": "t2", "refreshToken": "r2" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let rest = rest_client(&server);
        let auth = JwtSessionAuth::new(
            rest,
            "user".into(),
            SecretString::from("pw".to_string()),
            Duration::from_secs(60),
        );
        auth.login().await.unwrap();
        let token = auth.refresh_token().await.unwrap();
        assert_eq!(token.expose_secret(), "t2");
    }

    fn rest_client(server: &MockServer) -> RestClient {
        RestClient::new(
            server.uri().parse().unwrap(),
            &telemux_api::TransportConfig::default(),
        )
        .unwrap()
    }
}
