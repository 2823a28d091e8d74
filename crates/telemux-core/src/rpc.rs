// ── Device RPC session ──
//
// One-way and two-way device commands for a single target device. Tracks
// how many requests are in flight and the last failure, observable through
// a watch channel. Failures are also returned per request.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use telemux_api::RestClient;
use telemux_api::rest::error_detail;

use crate::auth::{AuthProvider, current_token};
use crate::error::CoreError;

/// Classified failure of one RPC request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFailure {
    pub status: u16,
    pub message: String,
}

impl RpcFailure {
    /// Build the user-facing message for a failed request.
    ///
    /// 408 and 409 get fixed messages; anything else reports the status
    /// line plus whatever detail the body carries.
    pub fn classify(status: u16, status_text: &str, body: Option<&str>) -> Self {
        let message = match status {
            408 => "Request Timeout.".to_owned(),
            409 => "Device is offline.".to_owned(),
            _ => {
                let mut message = format!("Error : {status} - {status_text}");
                let detail = body.map(error_detail).filter(|d| !d.trim().is_empty());
                if let Some(detail) = detail {
                    message.push('\n');
                    message.push_str(&detail);
                }
                message
            }
        };
        Self { status, message }
    }

    pub fn timeout() -> Self {
        Self::classify(408, "Request Timeout", None)
    }

    pub fn is_timeout(&self) -> bool {
        self.status == 408
    }

    fn from_api(err: &telemux_api::Error) -> Self {
        match err {
            telemux_api::Error::Http {
                status,
                status_text,
                body,
            } => Self::classify(*status, status_text, Some(body)),
            other => match other.status() {
                Some(status) => Self::classify(status, "", Some(&other.to_string())),
                None => Self::classify(0, "Unknown Error", Some(&other.to_string())),
            },
        }
    }

    fn from_core(err: &CoreError) -> Self {
        match err.status() {
            Some(status) => Self::classify(status, "", Some(&err.to_string())),
            None => Self::classify(0, "Unknown Error", Some(&err.to_string())),
        }
    }
}

impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Observable RPC state of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcState {
    pub in_flight: usize,
    pub failure: Option<RpcFailure>,
}

impl RpcState {
    pub fn is_executing(&self) -> bool {
        self.in_flight > 0
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    method: &'a str,
    params: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
}

/// RPC channel to one device. Without a device every request fails with
/// [`CoreError::RpcDisabled`].
pub struct RpcSession {
    rest: RestClient,
    auth: Arc<dyn AuthProvider>,
    device_id: Option<Uuid>,
    state: watch::Sender<RpcState>,
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession")
            .field("device_id", &self.device_id)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl RpcSession {
    pub fn new(rest: RestClient, auth: Arc<dyn AuthProvider>, device_id: Option<Uuid>) -> Self {
        Self {
            rest,
            auth,
            device_id,
            state: watch::Sender::new(RpcState::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.device_id.is_some()
    }

    pub fn state(&self) -> RpcState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<RpcState> {
        self.state.subscribe()
    }

    /// Fire-and-forget command; resolves once the server accepts it.
    pub async fn send_one_way(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CoreError> {
        self.send_command(true, method, params, timeout).await
    }

    /// Command whose response comes back from the device.
    pub async fn send_two_way(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CoreError> {
        self.send_command(false, method, params, timeout).await
    }

    /// Forget the recorded failure.
    pub fn clear_error(&self) {
        self.state.send_if_modified(|s| s.failure.take().is_some());
    }

    async fn send_command(
        &self,
        one_way: bool,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CoreError> {
        let Some(device_id) = self.device_id else {
            return Err(CoreError::RpcDisabled);
        };

        self.state.send_modify(|s| {
            if s.failure.as_ref().is_some_and(|f| !f.is_timeout()) {
                s.failure = None;
            }
            s.in_flight += 1;
        });

        let timeout = timeout.filter(|t| !t.is_zero());
        let timeout_ms = timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        let body = RpcRequest {
            method,
            params: &params,
            timeout: timeout_ms,
        };
        debug!(%device_id, method, one_way, ?timeout_ms, "sending rpc");

        match self.execute(device_id, one_way, &body, timeout).await {
            Ok(response) => {
                self.state.send_modify(|s| {
                    s.in_flight = s.in_flight.saturating_sub(1);
                    s.failure = None;
                });
                Ok(response)
            }
            Err(failure) => {
                warn!(%device_id, method, status = failure.status, "rpc failed");
                self.state.send_modify(|s| {
                    s.in_flight = s.in_flight.saturating_sub(1);
                    if s.in_flight == 0 || failure.is_timeout() {
                        s.failure = Some(failure.clone());
                    }
                });
                Err(CoreError::Rpc(failure))
            }
        }
    }

    async fn execute(
        &self,
        device_id: Uuid,
        one_way: bool,
        body: &RpcRequest<'_>,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcFailure> {
        let token = current_token(self.auth.as_ref())
            .await
            .map_err(|e| RpcFailure::from_core(&e))?;

        let call = self.rest.send_rpc(&token, device_id, one_way, body);
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| RpcFailure::timeout())?,
            None => call.await,
        };
        result.map_err(|e| RpcFailure::from_api(&e))
    }
}
