// ── Multiplexer state machine ──
//
// Sans-IO core of the telemetry connection. Inputs are subscriber calls,
// socket lifecycle events and timer firings, each stamped with the
// current instant. Outputs are queued `MuxAction`s for the driver to
// perform. Nothing here awaits.

use std::collections::{HashMap, VecDeque};

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use telemux_api::telemetry::{CommandBatch, SubscriptionUpdate, TelemetryCommand};
use telemux_api::websocket::ABNORMAL_CLOSURE;

use super::registry::SubscriberRegistry;
use super::{ConnectionState, SubscriberEvent, SubscriberId, WsNotice};
use crate::config::MuxSettings;

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxAction {
    /// Obtain a token and open a socket.
    Open,
    /// Write one text frame to the open socket.
    Send(String),
    /// Close the socket.
    Close,
    /// Token refresh failed; drop the session.
    Logout,
    /// Surface an error to the user.
    Notify(WsNotice),
}

struct SubscriberEntry {
    commands: Vec<TelemetryCommand>,
    events: mpsc::UnboundedSender<SubscriberEvent>,
}

pub struct Multiplexer {
    settings: MuxSettings,
    state: ConnectionState,
    active: bool,
    reconnect_pending: bool,
    last_cmd_id: i32,
    subscribers_count: usize,
    registry: SubscriberRegistry,
    subscribers: HashMap<SubscriberId, SubscriberEntry>,
    reconnect_subscribers: Vec<SubscriberId>,
    batch: CommandBatch,
    idle_close_at: Option<Instant>,
    reconnect_at: Option<Instant>,
    actions: VecDeque<MuxAction>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("state", &self.state)
            .field("active", &self.active)
            .field("reconnect_pending", &self.reconnect_pending)
            .field("subscribers_count", &self.subscribers_count)
            .field("pending_commands", &self.batch.len())
            .finish_non_exhaustive()
    }
}

impl Multiplexer {
    pub fn new(settings: MuxSettings) -> Self {
        Self {
            settings,
            state: ConnectionState::Closed,
            active: false,
            reconnect_pending: false,
            last_cmd_id: 0,
            subscribers_count: 0,
            registry: SubscriberRegistry::new(),
            subscribers: HashMap::new(),
            reconnect_subscribers: Vec::new(),
            batch: CommandBatch::new(),
            idle_close_at: None,
            reconnect_at: None,
            actions: VecDeque::new(),
        }
    }

    // ── Observers ────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn subscribers_count(&self) -> usize {
        self.subscribers_count
    }

    /// Commands of a subscriber as last issued, with their current ids.
    pub fn commands_of(&self, subscriber: SubscriberId) -> Option<&[TelemetryCommand]> {
        self.subscribers.get(&subscriber).map(|e| e.commands.as_slice())
    }

    /// Earliest armed timer, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.reconnect_at, self.idle_close_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Hand queued actions to the driver.
    pub fn take_actions(&mut self) -> Vec<MuxAction> {
        self.actions.drain(..).collect()
    }

    // ── Subscriber API ───────────────────────────────────────────────

    /// Register a subscriber's commands and push them out (opening the
    /// connection if needed).
    pub fn subscribe(
        &mut self,
        subscriber: SubscriberId,
        commands: Vec<TelemetryCommand>,
        events: mpsc::UnboundedSender<SubscriberEvent>,
        now: Instant,
    ) {
        self.subscribers
            .insert(subscriber, SubscriberEntry { commands, events });
        self.register(subscriber);
        self.publish(now);
    }

    /// Tell the server to stop a subscriber's commands and forget it.
    ///
    /// Unknown subscribers are ignored, so calling this twice is harmless.
    pub fn unsubscribe(&mut self, subscriber: SubscriberId, now: Instant) {
        let Some(entry) = self.subscribers.remove(&subscriber) else {
            return;
        };

        if let Some(pos) = self.reconnect_subscribers.iter().position(|s| *s == subscriber) {
            // Waiting for reconnect: nothing is registered on the server.
            self.reconnect_subscribers.remove(pos);
            debug!(subscriber, "dropped subscriber pending reconnect");
            return;
        }

        for cmd in &entry.commands {
            if self.active {
                if let Some(unsub) = cmd.unsubscribe_request() {
                    self.batch.enqueue(unsub);
                }
            }
            let cmd_id = cmd.cmd_id();
            if cmd_id != 0 {
                self.registry.unregister(cmd_id);
            }
        }
        self.subscribers_count = self.subscribers_count.saturating_sub(1);
        debug!(subscriber, remaining = self.subscribers_count, "unsubscribed");
        if self.active {
            self.publish(now);
        }
    }

    /// Deactivate and forget every subscriber. Their event channels close.
    pub fn shutdown(&mut self) {
        info!("telemetry multiplexer shutting down");
        self.hard_reset();
    }

    // ── Socket events ────────────────────────────────────────────────

    pub fn on_open(&mut self, now: Instant) {
        info!("telemetry connection open");
        self.state = ConnectionState::Open;
        self.reconnect_at = None;

        if self.reconnect_pending {
            self.reconnect_pending = false;
            let pending = std::mem::take(&mut self.reconnect_subscribers);
            info!(subscribers = pending.len(), "re-subscribing after reconnect");
            for subscriber in pending {
                if let Some(entry) = self.subscribers.get(&subscriber) {
                    // A closed receiver is cleaned up by its own unsubscribe.
                    let _ = entry.events.send(SubscriberEvent::Reconnected);
                    self.register(subscriber);
                }
            }
        }
        self.publish(now);
    }

    pub fn on_message(&mut self, text: &str, now: Instant) {
        let mut update: SubscriptionUpdate = match serde_json::from_str(text) {
            Ok(update) => update,
            Err(e) => {
                warn!(error = %e, "dropping malformed telemetry frame");
                return;
            }
        };

        if update.is_error() {
            self.notify(update.error_code, update.error_msg.as_deref());
        } else if update.subscription_id != 0 {
            self.dispatch(&mut update);
        }
        self.check_to_close(now);
    }

    pub fn on_close(&mut self, code: u16, reason: &str, now: Instant) {
        if code > 1000 && code != ABNORMAL_CLOSURE {
            self.notify(i32::from(code), Some(reason));
        }

        if !self.active {
            self.state = ConnectionState::Closed;
            return;
        }

        if !self.reconnect_pending {
            let mut pending: Vec<SubscriberId> = self.subscribers.keys().copied().collect();
            pending.sort_unstable();
            self.reconnect_subscribers = pending;
            self.reset();
            self.reconnect_pending = true;
        }
        let delay = self.settings.reconnect_delay;
        info!(code, ?delay, "telemetry connection lost, will reconnect");
        self.state = ConnectionState::Reconnecting;
        self.reconnect_at = Some(now + delay);
    }

    /// Token refresh failed while opening. Everything is dropped.
    pub fn on_auth_failed(&mut self) {
        warn!("token refresh failed, dropping all telemetry subscriptions");
        self.hard_reset();
        self.actions.push_back(MuxAction::Logout);
    }

    // ── Timers ───────────────────────────────────────────────────────

    pub fn on_timer(&mut self, now: Instant) {
        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            debug!("reconnect timer fired");
            self.try_open();
        }
        if self.idle_close_at.is_some_and(|at| at <= now) {
            self.idle_close_at = None;
            if self.subscribers_count == 0 {
                info!("closing idle telemetry connection");
                self.close_socket();
            }
        }
    }

    // ── Internals ────────────────────────────────────────────────────

    fn next_cmd_id(&mut self) -> i32 {
        self.last_cmd_id = self.last_cmd_id.checked_add(1).unwrap_or(1);
        self.last_cmd_id
    }

    /// Assign fresh ids to an existing subscriber's commands, register and
    /// queue them. The caller publishes.
    fn register(&mut self, subscriber: SubscriberId) {
        self.active = true;
        self.idle_close_at = None;

        let Some(entry) = self.subscribers.get_mut(&subscriber) else {
            return;
        };
        let mut commands = std::mem::take(&mut entry.commands);
        for (index, cmd) in commands.iter_mut().enumerate() {
            let cmd_id = self.next_cmd_id();
            cmd.set_cmd_id(cmd_id);
            self.registry.register(cmd_id, subscriber, index);
            self.batch.enqueue(cmd.clone());
        }
        if let Some(entry) = self.subscribers.get_mut(&subscriber) {
            entry.commands = commands;
        }
        self.subscribers_count += 1;
        debug!(subscriber, total = self.subscribers_count, "subscribed");
    }

    fn dispatch(&self, update: &mut SubscriptionUpdate) {
        let Some((subscriber, command_index)) = self.registry.lookup(update.subscription_id) else {
            debug!(cmd_id = update.subscription_id, "no subscriber for frame");
            return;
        };
        let Some(entry) = self.subscribers.get(&subscriber) else {
            return;
        };
        if let Some(cmd) = entry.commands.get(command_index) {
            update.prepare_data(&cmd.key_list());
        }
        let event = SubscriberEvent::Data {
            update: std::mem::take(update),
            command_index,
        };
        if entry.events.send(event).is_err() {
            debug!(subscriber, "subscriber receiver dropped");
        }
    }

    /// Flush queued commands while open, then make sure a connection is
    /// on its way.
    fn publish(&mut self, now: Instant) {
        while self.state == ConnectionState::Open && self.batch.has_pending() {
            let frame = self.batch.flush(self.settings.max_publish_commands);
            match frame.to_json() {
                Ok(text) => {
                    debug!(commands = frame.len(), "publishing telemetry commands");
                    self.actions.push_back(MuxAction::Send(text));
                }
                Err(e) => error!(error = %e, "failed to encode command frame"),
            }
        }
        self.check_to_close(now);
        self.try_open();
    }

    fn check_to_close(&mut self, now: Instant) {
        if self.subscribers_count == 0
            && self.state == ConnectionState::Open
            && self.idle_close_at.is_none()
        {
            self.idle_close_at = Some(now + self.settings.idle_timeout);
        }
    }

    fn try_open(&mut self) {
        if !self.active {
            return;
        }
        if matches!(
            self.state,
            ConnectionState::Closed | ConnectionState::Reconnecting
        ) {
            self.state = ConnectionState::Opening;
            self.reconnect_at = None;
            self.actions.push_back(MuxAction::Open);
        }
    }

    /// Forget registrations without touching subscribers (reconnect path).
    fn reset(&mut self) {
        self.idle_close_at = None;
        self.last_cmd_id = 0;
        self.registry.clear();
        self.subscribers_count = 0;
        self.batch.clear();
    }

    fn hard_reset(&mut self) {
        self.reset();
        self.subscribers.clear();
        self.reconnect_subscribers.clear();
        self.reconnect_pending = false;
        self.close_socket();
    }

    fn close_socket(&mut self) {
        self.active = false;
        if matches!(self.state, ConnectionState::Open | ConnectionState::Opening) {
            self.actions.push_back(MuxAction::Close);
        }
        self.state = ConnectionState::Closed;
        self.idle_close_at = None;
        self.reconnect_at = None;
    }

    fn notify(&mut self, code: i32, reason: Option<&str>) {
        let notice = WsNotice::new(code, reason);
        error!(code, "{notice}");
        self.actions.push_back(MuxAction::Notify(notice));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use telemux_api::telemetry::{
        AggregationType, AttributesSubscriptionCmd, CommandFrame, EntityRef,
        TimeseriesSubscriptionCmd,
    };
    use uuid::Uuid;

    type Events = mpsc::UnboundedReceiver<SubscriberEvent>;

    fn ts_cmd(keys: &[&str]) -> TelemetryCommand {
        let keys: Vec<String> = keys.iter().map(|k| (*k).to_string()).collect();
        TelemetryCommand::TimeseriesSubscribe(TimeseriesSubscriptionCmd::windowed(
            EntityRef::device(Uuid::nil()),
            &keys,
            1_000,
            60_000,
            1_000,
            500,
            AggregationType::Avg,
        ))
    }

    fn attr_cmd(key: &str) -> TelemetryCommand {
        TelemetryCommand::AttributeSubscribe(AttributesSubscriptionCmd::new(
            EntityRef::device(Uuid::nil()),
            &[key.to_string()],
            None,
        ))
    }

    fn add(mux: &mut Multiplexer, id: SubscriberId, cmds: Vec<TelemetryCommand>, now: Instant) -> Events {
        let (tx, rx) = mpsc::unbounded_channel();
        mux.subscribe(id, cmds, tx, now);
        rx
    }

    fn sent_frames(actions: &[MuxAction]) -> Vec<CommandFrame> {
        actions
            .iter()
            .filter_map(|a| match a {
                MuxAction::Send(text) => Some(serde_json::from_str(text).unwrap()),
                _ => None,
            })
            .collect()
    }

    /// Mux with one subscriber on an open connection, actions drained.
    fn open_with_subscriber(now: Instant) -> (Multiplexer, Events) {
        let mut mux = Multiplexer::new(MuxSettings::default());
        let rx = add(&mut mux, 1, vec![ts_cmd(&["temperature"])], now);
        assert_eq!(mux.take_actions(), vec![MuxAction::Open]);
        mux.on_open(now);
        let actions = mux.take_actions();
        assert_eq!(sent_frames(&actions).len(), 1);
        (mux, rx)
    }

    #[test]
    fn first_subscribe_opens_then_publishes_on_open() {
        let now = Instant::now();
        let mut mux = Multiplexer::new(MuxSettings::default());
        let _rx = add(&mut mux, 1, vec![ts_cmd(&["a"]), attr_cmd("b")], now);

        assert_eq!(mux.state(), ConnectionState::Opening);
        assert_eq!(mux.take_actions(), vec![MuxAction::Open]);

        mux.on_open(now);
        let frames = sent_frames(&mux.take_actions());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].ts_sub_cmds[0].cmd_id, 1);
        assert_eq!(frames[0].attr_sub_cmds[0].cmd_id, 2);
    }

    #[test]
    fn more_than_ten_commands_split_across_frames() {
        let now = Instant::now();
        let mut mux = Multiplexer::new(MuxSettings::default());
        let cmds: Vec<_> = (0..12).map(|i| ts_cmd(&[format!("k{i}").as_str()])).collect();
        let _rx = add(&mut mux, 1, cmds, now);
        mux.take_actions();

        mux.on_open(now);
        let frames = sent_frames(&mux.take_actions());
        assert_eq!(frames.iter().map(CommandFrame::len).collect::<Vec<_>>(), vec![10, 2]);
    }

    #[test]
    fn frames_are_routed_by_cmd_id_with_requested_keys() {
        let now = Instant::now();
        let (mut mux, mut rx) = open_with_subscriber(now);

        mux.on_message(
            &json!({ "subscriptionId": 1, "errorCode": 0, "data": {} }).to_string(),
            now,
        );

        match rx.try_recv().unwrap() {
            SubscriberEvent::Data {
                update,
                command_index,
            } => {
                assert_eq!(command_index, 0);
                assert!(update.data["temperature"].is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_ids_and_garbage_are_dropped() {
        let now = Instant::now();
        let (mut mux, mut rx) = open_with_subscriber(now);

        mux.on_message(&json!({ "subscriptionId": 99, "data": {} }).to_string(), now);
        mux.on_message("not json", now);

        assert!(rx.try_recv().is_err());
        assert!(mux.take_actions().is_empty());
    }

    #[test]
    fn error_frames_notify_and_are_not_delivered() {
        let now = Instant::now();
        let (mut mux, mut rx) = open_with_subscriber(now);

        mux.on_message(
            &json!({ "subscriptionId": 1, "errorCode": 2, "errorMsg": "Bad keys" }).to_string(),
            now,
        );

        assert!(rx.try_recv().is_err());
        assert_eq!(
            mux.take_actions(),
            vec![MuxAction::Notify(WsNotice {
                code: 2,
                message: "WebSocket Error: Bad keys".into()
            })]
        );
    }

    #[test]
    fn error_frames_without_subscription_id_still_notify() {
        let now = Instant::now();
        let (mut mux, mut rx) = open_with_subscriber(now);

        mux.on_message(r#"{"errorCode":2,"errorMsg":"Unauthorized"}"#, now);

        assert!(rx.try_recv().is_err());
        assert_eq!(
            mux.take_actions(),
            vec![MuxAction::Notify(WsNotice {
                code: 2,
                message: "WebSocket Error: Unauthorized".into()
            })]
        );
    }

    #[test]
    fn zero_publish_cap_sends_one_command_per_frame() {
        let now = Instant::now();
        let mut mux = Multiplexer::new(MuxSettings {
            max_publish_commands: 0,
            ..MuxSettings::default()
        });
        let _rx = add(&mut mux, 1, vec![ts_cmd(&["a"]), attr_cmd("b")], now);
        assert_eq!(mux.take_actions(), vec![MuxAction::Open]);

        mux.on_open(now);
        let frames = sent_frames(&mux.take_actions());
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].ts_sub_cmds[0].cmd_id, 1);
        assert_eq!(frames[1].attr_sub_cmds[0].cmd_id, 2);
    }

    #[test]
    fn idle_connection_closes_after_timeout() {
        let t0 = Instant::now();
        let (mut mux, _rx) = open_with_subscriber(t0);

        mux.unsubscribe(1, t0);
        let frames = sent_frames(&mux.take_actions());
        assert!(frames[0].ts_sub_cmds[0].unsubscribe);
        assert_eq!(mux.next_deadline(), Some(t0 + Duration::from_millis(90_000)));

        mux.on_timer(t0 + Duration::from_millis(89_999));
        assert_eq!(mux.state(), ConnectionState::Open);

        mux.on_timer(t0 + Duration::from_millis(90_000));
        assert_eq!(mux.state(), ConnectionState::Closed);
        assert_eq!(mux.take_actions(), vec![MuxAction::Close]);
        assert!(!mux.is_active());
    }

    #[test]
    fn new_subscription_cancels_idle_close() {
        let t0 = Instant::now();
        let (mut mux, _rx) = open_with_subscriber(t0);

        mux.unsubscribe(1, t0);
        let _rx2 = add(&mut mux, 2, vec![ts_cmd(&["humidity"])], t0 + Duration::from_millis(50_000));
        assert!(mux.next_deadline().is_none());

        mux.on_timer(t0 + Duration::from_millis(90_000));
        assert_eq!(mux.state(), ConnectionState::Open);
        assert!(!mux.take_actions().contains(&MuxAction::Close));
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let now = Instant::now();
        let (mut mux, _rx) = open_with_subscriber(now);

        mux.unsubscribe(1, now);
        let first = mux.take_actions();
        mux.unsubscribe(1, now);

        assert_eq!(sent_frames(&first).len(), 1);
        assert!(mux.take_actions().is_empty());
        assert_eq!(mux.subscribers_count(), 0);
    }

    #[test]
    fn abnormal_close_reconnects_silently_and_resubscribes() {
        let t0 = Instant::now();
        let mut mux = Multiplexer::new(MuxSettings::default());
        let mut rx_a = add(&mut mux, 1, vec![ts_cmd(&["a"])], t0);
        let mut rx_b = add(&mut mux, 2, vec![attr_cmd("b"), ts_cmd(&["c"])], t0);
        mux.on_open(t0);
        let before = sent_frames(&mux.take_actions());

        for round in 1..=3u64 {
            let closed_at = t0 + Duration::from_secs(round * 10);
            mux.on_close(1006, "", closed_at);
            assert_eq!(mux.state(), ConnectionState::Reconnecting);
            assert!(mux.take_actions().is_empty(), "abnormal closure is not surfaced");

            // A failed attempt re-arms the timer.
            mux.on_timer(closed_at + Duration::from_millis(2_000));
            assert_eq!(mux.take_actions(), vec![MuxAction::Open]);
            mux.on_close(1006, "", closed_at + Duration::from_millis(2_100));
            assert_eq!(
                mux.next_deadline(),
                Some(closed_at + Duration::from_millis(4_100))
            );

            mux.on_timer(closed_at + Duration::from_millis(4_100));
            assert_eq!(mux.take_actions(), vec![MuxAction::Open]);
            mux.on_open(closed_at + Duration::from_millis(4_200));

            let after = sent_frames(&mux.take_actions());
            assert_eq!(after, before, "round {round}: commands re-issued identically");
            assert_eq!(rx_a.try_recv().unwrap(), SubscriberEvent::Reconnected);
            assert_eq!(rx_b.try_recv().unwrap(), SubscriberEvent::Reconnected);
            assert_eq!(mux.subscribers_count(), 2);
        }
    }

    #[test]
    fn meaningful_close_codes_are_surfaced() {
        let now = Instant::now();
        let (mut mux, _rx) = open_with_subscriber(now);

        mux.on_close(1008, "Policy violation", now);
        assert_eq!(
            mux.take_actions(),
            vec![MuxAction::Notify(WsNotice {
                code: 1008,
                message: "WebSocket Error: Policy violation".into()
            })]
        );
        assert_eq!(mux.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn unsubscribe_while_reconnecting_is_local_only() {
        let now = Instant::now();
        let (mut mux, _rx) = open_with_subscriber(now);
        mux.on_close(1006, "", now);

        mux.unsubscribe(1, now);
        mux.on_timer(now + Duration::from_millis(2_000));
        assert_eq!(mux.take_actions(), vec![MuxAction::Open]);
        mux.on_open(now + Duration::from_millis(2_100));

        assert!(sent_frames(&mux.take_actions()).is_empty());
        assert!(mux.commands_of(1).is_none());
    }

    #[test]
    fn auth_failure_drops_everyone() {
        let now = Instant::now();
        let mut mux = Multiplexer::new(MuxSettings::default());
        let mut rx = add(&mut mux, 1, vec![ts_cmd(&["a"])], now);
        mux.take_actions();

        mux.on_auth_failed();

        assert_eq!(mux.take_actions(), vec![MuxAction::Close, MuxAction::Logout]);
        assert_eq!(mux.state(), ConnectionState::Closed);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn close_after_deactivation_does_not_reconnect() {
        let now = Instant::now();
        let (mut mux, _rx) = open_with_subscriber(now);
        mux.shutdown();
        assert_eq!(mux.take_actions(), vec![MuxAction::Close]);

        mux.on_close(1000, "", now);
        assert_eq!(mux.state(), ConnectionState::Closed);
        assert!(mux.next_deadline().is_none());
    }
}
