// ── Telemetry service ──
//
// Tokio driver for the `Multiplexer`. One task owns the state machine and
// the current socket; everything else talks to it over channels. Each
// input (subscriber command, socket event, timer) is handled to completion
// before the next one is polled.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use secrecy::ExposeSecret;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use telemux_api::telemetry::TelemetryCommand;
use telemux_api::websocket::{ABNORMAL_CLOSURE, telemetry_url};
use telemux_api::{Connector, SocketEvent, SocketHandle};

use super::state::{Multiplexer, MuxAction};
use super::{ConnectionState, SubscriberEvent, SubscriberId, WsNotice};
use crate::auth::{AuthProvider, current_token};
use crate::config::MuxSettings;
use crate::error::CoreError;

const NOTICE_CAPACITY: usize = 64;

enum ServiceCmd {
    Subscribe {
        id: SubscriberId,
        commands: Vec<TelemetryCommand>,
        events: mpsc::UnboundedSender<SubscriberEvent>,
    },
    Unsubscribe {
        id: SubscriberId,
    },
    Shutdown,
}

// ── TelemetryService ─────────────────────────────────────────────────

/// Handle to the shared telemetry connection.
///
/// Cheaply cloneable. The connection opens lazily on the first
/// subscription and closes after the idle timeout once the last
/// subscription is gone.
#[derive(Clone)]
pub struct TelemetryService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    cmd_tx: mpsc::UnboundedSender<ServiceCmd>,
    state_rx: watch::Receiver<ConnectionState>,
    notice_tx: broadcast::Sender<WsNotice>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for TelemetryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryService")
            .field("state", &*self.inner.state_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl TelemetryService {
    /// Spawn the driver task. Must be called from within a tokio runtime.
    pub fn start(
        settings: MuxSettings,
        endpoint: Url,
        auth: Arc<dyn AuthProvider>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);
        let (notice_tx, _) = broadcast::channel(NOTICE_CAPACITY);

        let driver = Driver {
            mux: Multiplexer::new(settings),
            endpoint,
            auth,
            connector,
            socket: None,
            socket_rx: None,
            state_tx,
            notice_tx: notice_tx.clone(),
        };
        tokio::spawn(driver.run(cmd_rx));

        Self {
            inner: Arc::new(ServiceInner {
                cmd_tx,
                state_rx,
                notice_tx,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Issue `commands` over the shared connection.
    ///
    /// The returned [`Subscription`] yields data for these commands until
    /// it is unsubscribed or dropped.
    pub fn subscribe(&self, commands: Vec<TelemetryCommand>) -> Result<Subscription, CoreError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.inner
            .cmd_tx
            .send(ServiceCmd::Subscribe {
                id,
                commands,
                events: events_tx,
            })
            .map_err(|_| CoreError::ServiceStopped)?;

        Ok(Subscription {
            id,
            events: events_rx,
            cmd_tx: self.inner.cmd_tx.clone(),
            active: true,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// User-visible websocket errors.
    pub fn notices(&self) -> broadcast::Receiver<WsNotice> {
        self.inner.notice_tx.subscribe()
    }

    /// Close the connection and drop every subscriber.
    pub fn shutdown(&self) {
        let _ = self.inner.cmd_tx.send(ServiceCmd::Shutdown);
    }
}

// ── Subscription ─────────────────────────────────────────────────────

/// One subscriber's view of the shared connection.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    events: mpsc::UnboundedReceiver<SubscriberEvent>,
    cmd_tx: mpsc::UnboundedSender<ServiceCmd>,
    active: bool,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once the service dropped this subscriber.
    pub async fn recv(&mut self) -> Option<SubscriberEvent> {
        self.events.recv().await
    }

    /// Stop the server-side subscription. Safe to call repeatedly.
    pub fn unsubscribe(&mut self) {
        if std::mem::take(&mut self.active) {
            let _ = self.cmd_tx.send(ServiceCmd::Unsubscribe { id: self.id });
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for ServiceCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscribe { id, commands, .. } => f
                .debug_struct("Subscribe")
                .field("id", id)
                .field("commands", &commands.len())
                .finish_non_exhaustive(),
            Self::Unsubscribe { id } => f.debug_struct("Unsubscribe").field("id", id).finish(),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

// ── Driver task ──────────────────────────────────────────────────────

struct Driver {
    mux: Multiplexer,
    endpoint: Url,
    auth: Arc<dyn AuthProvider>,
    connector: Arc<dyn Connector>,
    socket: Option<SocketHandle>,
    socket_rx: Option<mpsc::UnboundedReceiver<SocketEvent>>,
    state_tx: watch::Sender<ConnectionState>,
    notice_tx: broadcast::Sender<WsNotice>,
}

impl Driver {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<ServiceCmd>) {
        debug!(endpoint = %self.endpoint, "telemetry service started");
        loop {
            let deadline = self.mux.next_deadline();
            let stop = tokio::select! {
                biased;

                cmd = cmd_rx.recv() => self.handle_cmd(cmd),
                event = next_socket_event(&mut self.socket_rx) => {
                    self.handle_socket_event(event);
                    false
                }
                () = sleep_until_deadline(deadline) => {
                    self.mux.on_timer(Instant::now());
                    false
                }
            };

            self.apply_actions().await;
            self.publish_state();
            if stop {
                break;
            }
        }
        debug!("telemetry service stopped");
    }

    /// Returns `true` when the task should exit.
    fn handle_cmd(&mut self, cmd: Option<ServiceCmd>) -> bool {
        let now = Instant::now();
        match cmd {
            Some(ServiceCmd::Subscribe {
                id,
                commands,
                events,
            }) => {
                self.mux.subscribe(id, commands, events, now);
                false
            }
            Some(ServiceCmd::Unsubscribe { id }) => {
                self.mux.unsubscribe(id, now);
                false
            }
            Some(ServiceCmd::Shutdown) | None => {
                self.mux.shutdown();
                true
            }
        }
    }

    fn handle_socket_event(&mut self, event: Option<SocketEvent>) {
        let now = Instant::now();
        match event {
            Some(SocketEvent::Opened) => self.mux.on_open(now),
            Some(SocketEvent::Frame(text)) => self.mux.on_message(&text, now),
            Some(SocketEvent::Closed { code, reason }) => {
                self.drop_socket();
                self.mux.on_close(code, &reason, now);
            }
            None => {
                self.drop_socket();
                self.mux.on_close(ABNORMAL_CLOSURE, "", now);
            }
        }
    }

    async fn apply_actions(&mut self) {
        loop {
            let actions = self.mux.take_actions();
            if actions.is_empty() {
                return;
            }
            for action in actions {
                match action {
                    MuxAction::Open => self.open_socket().await,
                    MuxAction::Send(text) => {
                        let sent = self.socket.as_ref().is_some_and(|s| s.send(text));
                        if !sent {
                            debug!("socket gone, frame dropped");
                        }
                    }
                    MuxAction::Close => {
                        if let Some(socket) = self.socket.take() {
                            socket.close();
                        }
                        self.socket_rx = None;
                    }
                    MuxAction::Logout => self.auth.logout(),
                    MuxAction::Notify(notice) => {
                        // No receivers is fine: the notice is already logged.
                        let _ = self.notice_tx.send(notice);
                    }
                }
            }
        }
    }

    async fn open_socket(&mut self) {
        let token = match current_token(self.auth.as_ref()).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "cannot obtain token for telemetry connection");
                self.mux.on_auth_failed();
                return;
            }
        };

        let url = match telemetry_url(&self.endpoint, token.expose_secret()) {
            Ok(url) => url,
            Err(e) => {
                error!(error = %e, "invalid telemetry endpoint");
                self.mux.on_close(ABNORMAL_CLOSURE, "", Instant::now());
                return;
            }
        };

        self.drop_socket();
        info!(host = url.host_str().unwrap_or(""), "opening telemetry connection");
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.socket = Some(self.connector.open(url, events_tx));
        self.socket_rx = Some(events_rx);
    }

    fn drop_socket(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
        self.socket_rx = None;
    }

    fn publish_state(&self) {
        let state = self.mux.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

async fn next_socket_event(
    rx: &mut Option<mpsc::UnboundedReceiver<SocketEvent>>,
) -> Option<SocketEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

pub(crate) async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use futures_util::future::BoxFuture;
    use pretty_assertions::assert_eq;
    use secrecy::SecretString;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use telemux_api::telemetry::{CommandFrame, EntityRef, TimeseriesSubscriptionCmd};

    use super::*;
    use crate::auth::StaticTokenAuth;

    struct MockSocket {
        url: Url,
        events: mpsc::UnboundedSender<SocketEvent>,
        outbound: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    }

    impl MockSocket {
        async fn next_frame(&mut self) -> CommandFrame {
            let text = self.outbound.recv().await.unwrap();
            serde_json::from_str(&text).unwrap()
        }
    }

    struct MockConnector {
        opened: mpsc::UnboundedSender<MockSocket>,
    }

    impl Connector for MockConnector {
        fn open(&self, url: Url, events: mpsc::UnboundedSender<SocketEvent>) -> SocketHandle {
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let cancel = CancellationToken::new();
            let _ = self.opened.send(MockSocket {
                url,
                events,
                outbound: outbound_rx,
                cancel: cancel.clone(),
            });
            SocketHandle::new(outbound_tx, cancel)
        }
    }

    struct RejectingAuth {
        logged_out: AtomicBool,
    }

    impl AuthProvider for RejectingAuth {
        fn is_token_valid(&self) -> bool {
            false
        }

        fn token(&self) -> Option<SecretString> {
            None
        }

        fn refresh_token(&self) -> BoxFuture<'_, Result<SecretString, CoreError>> {
            Box::pin(async {
                Err(CoreError::AuthenticationFailed {
                    message: "refresh rejected".into(),
                })
            })
        }

        fn logout(&self) {
            self.logged_out.store(true, Ordering::Release);
        }
    }

    fn start(auth: Arc<dyn AuthProvider>) -> (TelemetryService, mpsc::UnboundedReceiver<MockSocket>) {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        let service = TelemetryService::start(
            MuxSettings::default(),
            "http://iot.local:8080".parse().unwrap(),
            auth,
            Arc::new(MockConnector { opened: opened_tx }),
        );
        (service, opened_rx)
    }

    fn static_auth() -> Arc<dyn AuthProvider> {
        Arc::new(StaticTokenAuth::new(SecretString::from("jwt".to_string())))
    }

    fn temperature() -> TelemetryCommand {
        TelemetryCommand::TimeseriesSubscribe(TimeseriesSubscriptionCmd::latest(
            EntityRef::device(Uuid::nil()),
            &["temperature".into()],
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_opens_socket_and_receives_data() {
        let (service, mut opened) = start(static_auth());
        let mut sub = service.subscribe(vec![temperature()]).unwrap();

        let mut socket = opened.recv().await.unwrap();
        assert_eq!(
            socket.url.as_str(),
            "ws://iot.local:8080/api/ws/plugins/telemetry?token=jwt"
        );
        socket.events.send(SocketEvent::Opened).unwrap();

        let frame = socket.next_frame().await;
        assert_eq!(frame.ts_sub_cmds[0].cmd_id, 1);
        assert_eq!(frame.ts_sub_cmds[0].keys, "temperature");

        let update = json!({
            "subscriptionId": 1,
            "errorCode": 0,
            "data": { "temperature": [[1000, "21.5"]] }
        });
        socket
            .events
            .send(SocketEvent::Frame(update.to_string()))
            .unwrap();

        match sub.recv().await.unwrap() {
            SubscriberEvent::Data {
                update,
                command_index,
            } => {
                assert_eq!(command_index, 0);
                assert_eq!(update.data["temperature"], vec![(1000, json!("21.5"))]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(service.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_close_reconnects_after_delay() {
        let (service, mut opened) = start(static_auth());
        let mut sub = service.subscribe(vec![temperature()]).unwrap();

        let mut first = opened.recv().await.unwrap();
        first.events.send(SocketEvent::Opened).unwrap();
        let before = first.next_frame().await;

        let dropped_at = Instant::now();
        first
            .events
            .send(SocketEvent::Closed {
                code: 1006,
                reason: String::new(),
            })
            .unwrap();

        let mut second = opened.recv().await.unwrap();
        assert!(Instant::now() - dropped_at >= Duration::from_millis(2_000));
        second.events.send(SocketEvent::Opened).unwrap();

        assert_eq!(sub.recv().await.unwrap(), SubscriberEvent::Reconnected);
        assert_eq!(second.next_frame().await, before);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_closes_after_last_unsubscribe() {
        let (service, mut opened) = start(static_auth());
        let sub = service.subscribe(vec![temperature()]).unwrap();

        let mut socket = opened.recv().await.unwrap();
        socket.events.send(SocketEvent::Opened).unwrap();
        socket.next_frame().await;

        drop(sub);
        let unsubscribe = socket.next_frame().await;
        assert!(unsubscribe.ts_sub_cmds[0].unsubscribe);

        let idle_since = Instant::now();
        socket.cancel.cancelled().await;
        assert!(Instant::now() - idle_since >= Duration::from_millis(90_000));

        let mut state = service.state_changes();
        state
            .wait_for(|s| *s == ConnectionState::Closed)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_failure_drops_subscribers_and_logs_out() {
        let auth = Arc::new(RejectingAuth {
            logged_out: AtomicBool::new(false),
        });
        let (service, mut opened) = start(auth.clone());
        let mut sub = service.subscribe(vec![temperature()]).unwrap();

        assert!(sub.recv().await.is_none());
        assert!(auth.logged_out.load(Ordering::Acquire));
        assert!(opened.try_recv().is_err());
        assert_eq!(service.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn server_close_code_is_broadcast() {
        let (service, mut opened) = start(static_auth());
        let mut notices = service.notices();
        let _sub = service.subscribe(vec![temperature()]).unwrap();

        let socket = opened.recv().await.unwrap();
        socket.events.send(SocketEvent::Opened).unwrap();
        socket
            .events
            .send(SocketEvent::Closed {
                code: 4001,
                reason: "Token expired".into(),
            })
            .unwrap();

        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.code, 4001);
        assert_eq!(notice.message, "WebSocket Error: Token expired");
    }
}
