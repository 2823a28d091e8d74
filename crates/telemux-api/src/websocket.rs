//! Telemetry websocket transport.
//!
//! A [`Connector`] opens one socket per call and reports its lifecycle as
//! [`SocketEvent`]s on a caller-supplied channel. The caller owns all
//! reconnect policy; a socket task here lives exactly as long as one
//! underlying connection.
//!
//! # Example
//!
//! ```rust,ignore
//! use telemux_api::websocket::{Connector, SocketEvent, WsConnector, telemetry_url};
//! use tokio::sync::mpsc;
//!
//! let url = telemetry_url(&"https://iot.example.com".parse()?, "jwt")?;
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! let socket = WsConnector.open(url, tx);
//!
//! while let Some(event) = rx.recv().await {
//!     if let SocketEvent::Opened = event {
//!         socket.send(r#"{"tsSubCmds":[],"historyCmds":[],"attrSubCmds":[]}"#.into());
//!     }
//! }
//! ```

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;

/// Path of the telemetry plugin endpoint on the server.
pub const TELEMETRY_PATH: &str = "/api/ws/plugins/telemetry";

/// Close code reported when the connection drops without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;
const NORMAL_CLOSURE: u16 = 1000;
const NO_STATUS: u16 = 1005;

// ── SocketEvent ──────────────────────────────────────────────────────

/// Lifecycle of a single socket, in order: at most one `Opened`, any
/// number of `Frame`s, then exactly one `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Opened,
    Frame(String),
    Closed { code: u16, reason: String },
}

// ── SocketHandle ─────────────────────────────────────────────────────

/// Write side of an open (or opening) socket.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl SocketHandle {
    pub fn new(outbound: mpsc::UnboundedSender<String>, cancel: CancellationToken) -> Self {
        Self { outbound, cancel }
    }

    /// Queue a text frame. Returns `false` once the socket task has gone.
    pub fn send(&self, text: String) -> bool {
        self.outbound.send(text).is_ok()
    }

    /// Ask the socket task to send a close frame and stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }
}

// ── Connector ────────────────────────────────────────────────────────

/// Opens telemetry sockets.
///
/// Implementations must not block: `open` returns immediately and the
/// connection outcome arrives on `events`.
pub trait Connector: Send + Sync {
    fn open(&self, url: Url, events: mpsc::UnboundedSender<SocketEvent>) -> SocketHandle;
}

/// [`Connector`] backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&self, url: Url, events: mpsc::UnboundedSender<SocketEvent>) -> SocketHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            run_socket(url, events, outbound_rx, task_cancel).await;
        });

        SocketHandle::new(outbound_tx, cancel)
    }
}

/// Build the telemetry endpoint URL from the server base URL.
///
/// `http` maps to `ws` and `https` to `wss`; the port falls back to the
/// scheme default. The token rides in the `token` query parameter.
pub fn telemetry_url(base: &Url, token: &str) -> Result<Url, Error> {
    let secure = matches!(base.scheme(), "https" | "wss");
    let scheme = if secure { "wss" } else { "ws" };
    let host = base.host_str().ok_or(url::ParseError::EmptyHost)?;
    let port = base
        .port_or_known_default()
        .unwrap_or(if secure { 443 } else { 80 });

    let mut url = Url::parse(&format!("{scheme}://{host}:{port}{TELEMETRY_PATH}"))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

// ── Single connection lifecycle ──────────────────────────────────────

async fn run_socket(
    url: Url,
    events: mpsc::UnboundedSender<SocketEvent>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let (code, reason) = match connect_and_pump(&url, &events, &mut outbound, &cancel).await {
        Ok(close) => close,
        Err(e) => {
            tracing::warn!(host = url.host_str().unwrap_or(""), error = %e, "telemetry socket error");
            (ABNORMAL_CLOSURE, e.to_string())
        }
    };
    tracing::debug!(code, reason = %reason, "telemetry socket closed");
    // Receiver gone means nobody cares about this socket anymore.
    let _ = events.send(SocketEvent::Closed { code, reason });
}

/// Connect, then shuttle frames both ways until either side closes.
///
/// Returns the close code and reason on an orderly shutdown.
async fn connect_and_pump(
    url: &Url,
    events: &mpsc::UnboundedSender<SocketEvent>,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> Result<(u16, String), Error> {
    tracing::info!(
        host = url.host_str().unwrap_or(""),
        path = url.path(),
        "connecting telemetry socket"
    );

    let connect = tokio_tungstenite::connect_async(url.as_str());
    let (ws_stream, _response) = tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok((NORMAL_CLOSURE, String::new())),
        result = connect => result.map_err(|e| Error::WebSocketConnect(e.to_string()))?,
    };

    tracing::info!("telemetry socket connected");
    let _ = events.send(SocketEvent::Opened);

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok((NORMAL_CLOSURE, String::new()));
            }
            msg = outbound.recv() => {
                let Some(text) = msg else {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok((NORMAL_CLOSURE, String::new()));
                };
                tracing::trace!(bytes = text.len(), "telemetry frame out");
                write
                    .send(Message::text(text))
                    .await
                    .map_err(|e| Error::WebSocketConnect(e.to_string()))?;
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        tracing::trace!(bytes = text.len(), "telemetry frame in");
                        let _ = events.send(SocketEvent::Frame(text.as_str().to_owned()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Ok(match frame {
                            Some(cf) => (u16::from(cf.code), cf.reason.as_str().to_owned()),
                            None => (NO_STATUS, String::new()),
                        });
                    }
                    Some(Ok(_)) => {
                        // Binary, Ping, Pong, Frame: tungstenite answers pings itself
                    }
                    Some(Err(e)) => return Err(Error::WebSocketConnect(e.to_string())),
                    None => return Ok((ABNORMAL_CLOSURE, "stream ended".into())),
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_base_maps_to_wss() {
        let base = Url::parse("https://iot.example.com/dashboard").unwrap();
        let url = telemetry_url(&base, "abc").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.port_or_known_default(), Some(443));
        assert_eq!(url.path(), TELEMETRY_PATH);
        assert_eq!(url.query(), Some("token=abc"));
    }

    #[test]
    fn http_base_keeps_explicit_port() {
        let base = Url::parse("http://localhost:8080").unwrap();
        let url = telemetry_url(&base, "t").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:8080/api/ws/plugins/telemetry?token=t"
        );
    }

    #[test]
    fn base_without_host_is_rejected() {
        let base = Url::parse("file:///tmp/x").unwrap();
        assert!(matches!(
            telemetry_url(&base, "t"),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn handle_reports_closed_after_close() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = SocketHandle::new(tx, CancellationToken::new());
        assert!(!handle.is_closed());
        assert!(handle.send("x".into()));
        handle.close();
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn unreachable_server_reports_abnormal_close() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let url = Url::parse(&format!("ws://127.0.0.1:{port}/")).unwrap();
        let _handle = WsConnector.open(url, tx);

        match rx.recv().await {
            Some(SocketEvent::Closed { code, .. }) => assert_eq!(code, ABNORMAL_CLOSURE),
            other => panic!("expected close, got {other:?}"),
        }
    }
}
