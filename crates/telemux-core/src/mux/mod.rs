//! Connection multiplexer.
//!
//! Many logical subscriptions share one telemetry socket. [`Multiplexer`]
//! is the pure state machine; [`TelemetryService`] is the tokio task that
//! drives it against a real (or mock) [`Connector`](telemux_api::Connector).

pub mod registry;
pub mod service;
pub mod state;

use telemux_api::telemetry::SubscriptionUpdate;

pub use registry::SubscriberRegistry;
pub use service::{Subscription, TelemetryService};
pub use state::{MuxAction, Multiplexer};

/// Identity of one subscriber, stable across reconnects.
pub type SubscriberId = u64;

/// Connection lifecycle, observable through [`TelemetryService::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum ConnectionState {
    #[default]
    Closed,
    Opening,
    Open,
    Reconnecting,
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberEvent {
    /// A frame for one of the subscriber's commands. Every key the
    /// command names is present in `update.data`.
    Data {
        update: SubscriptionUpdate,
        command_index: usize,
    },
    /// The connection dropped and came back; commands were re-issued.
    Reconnected,
}

/// User-visible websocket error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsNotice {
    pub code: i32,
    pub message: String,
}

impl WsNotice {
    pub fn new(code: i32, reason: Option<&str>) -> Self {
        let message = match reason.filter(|r| !r.is_empty()) {
            Some(reason) => format!("WebSocket Error: {reason}"),
            None => format!("WebSocket Error: error code - {code}."),
        };
        Self { code, message }
    }
}

impl std::fmt::Display for WsNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notice_prefers_reason() {
        assert_eq!(
            WsNotice::new(1008, Some("Policy")).message,
            "WebSocket Error: Policy"
        );
        assert_eq!(
            WsNotice::new(11, None).message,
            "WebSocket Error: error code - 11."
        );
        assert_eq!(
            WsNotice::new(11, Some("")).message,
            "WebSocket Error: error code - 11."
        );
    }
}
