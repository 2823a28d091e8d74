// telemux-core: telemetry multiplexing, time-window aggregation and
// subscription orchestration on top of telemux-api.
//
// The multiplexer and the aggregator are sans-IO state machines driven by
// tokio tasks. Everything user-facing goes through `TelemetryService`,
// `WidgetSubscription` and `RpcSession`.

pub mod aggregation;
pub mod auth;
pub mod config;
pub mod error;
pub mod mux;
pub mod rpc;
pub mod subscription;

// ── Primary re-exports ──────────────────────────────────────────────
pub use auth::{AuthProvider, JwtSessionAuth, StaticTokenAuth};
pub use config::{AuthCredentials, MuxSettings, ServiceConfig, TlsVerification};
pub use error::CoreError;
pub use mux::{ConnectionState, SubscriberEvent, Subscription, TelemetryService, WsNotice};
pub use rpc::{RpcFailure, RpcSession, RpcState};
pub use subscription::{
    ComparisonUnit, DataKind, SubscriptionController, SubscriptionRequest,
    SubscriptionTimewindow, TimeRange, Timewindow, WidgetEvent, WidgetSubscription,
};

// ── Aggregation types ───────────────────────────────────────────────
pub use aggregation::{DataAggregator, Point, SampleValue, Snapshot, WindowSpec};

// ── Wire types callers need to build requests ───────────────────────
pub use telemux_api::telemetry::{
    AggregationType, AttributeData, AttributeScope, EntityRef, EntityType, SubscriptionData,
};

use std::sync::Arc;

/// Build the auth provider `config` asks for.
pub fn auth_provider(config: &ServiceConfig) -> Result<Arc<dyn AuthProvider>, CoreError> {
    match &config.auth {
        AuthCredentials::Token(token) => Ok(Arc::new(StaticTokenAuth::new(token.clone()))),
        AuthCredentials::Credentials { username, password } => {
            let rest = telemux_api::RestClient::new(config.url.clone(), &config.transport())?;
            Ok(Arc::new(JwtSessionAuth::new(
                rest,
                username.clone(),
                password.clone(),
                config.token_lifetime,
            )))
        }
    }
}

/// Start a telemetry service for `config` on the real websocket transport.
pub fn connect(config: &ServiceConfig, auth: Arc<dyn AuthProvider>) -> TelemetryService {
    TelemetryService::start(
        config.mux.clone(),
        config.url.clone(),
        auth,
        Arc::new(telemux_api::WsConnector),
    )
}

/// RPC session for `device_id` on the server `config` points at.
pub fn rpc_session(
    config: &ServiceConfig,
    auth: Arc<dyn AuthProvider>,
    device_id: Option<uuid::Uuid>,
) -> Result<RpcSession, CoreError> {
    let rest = telemux_api::RestClient::new(config.url.clone(), &config.transport())?;
    Ok(RpcSession::new(rest, auth, device_id))
}
