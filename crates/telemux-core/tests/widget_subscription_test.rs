// End-to-end tests for `WidgetSubscription` over a scripted connector.
#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use secrecy::SecretString;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use telemux_api::telemetry::CommandFrame;
use telemux_api::{Connector, SocketEvent, SocketHandle};
use telemux_core::subscription::create_subscription_timewindow;
use telemux_core::{
    AggregationType, DataKind, EntityRef, MuxSettings, SampleValue, StaticTokenAuth,
    SubscriptionRequest, TelemetryService, Timewindow, WidgetEvent, WidgetSubscription,
};

// ── Scripted connector ──────────────────────────────────────────────

struct ScriptedSocket {
    events: mpsc::UnboundedSender<SocketEvent>,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl ScriptedSocket {
    async fn frame(&mut self) -> CommandFrame {
        serde_json::from_str(&self.outbound.recv().await.unwrap()).unwrap()
    }

    fn push(&self, update: &serde_json::Value) {
        self.events
            .send(SocketEvent::Frame(update.to_string()))
            .unwrap();
    }
}

struct ScriptedConnector {
    opened: mpsc::UnboundedSender<ScriptedSocket>,
}

impl Connector for ScriptedConnector {
    fn open(&self, _url: Url, events: mpsc::UnboundedSender<SocketEvent>) -> SocketHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.opened.send(ScriptedSocket {
            events,
            outbound: rx,
        });
        SocketHandle::new(tx, CancellationToken::new())
    }
}

fn service() -> (TelemetryService, mpsc::UnboundedReceiver<ScriptedSocket>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let service = TelemetryService::start(
        MuxSettings::default(),
        "https://iot.example.com".parse().unwrap(),
        Arc::new(StaticTokenAuth::new(SecretString::from("jwt".to_owned()))),
        Arc::new(ScriptedConnector { opened: tx }),
    );
    (service, rx)
}

fn request() -> SubscriptionRequest {
    SubscriptionRequest {
        entity: EntityRef::device(Uuid::nil()),
        keys: vec!["temperature".into()],
        kind: DataKind::Timeseries,
        state_data: false,
    }
}

fn window(now_ms: i64) -> telemux_core::SubscriptionTimewindow {
    let tw = Timewindow::realtime(10_000)
        .with_interval(1_000)
        .with_agg(AggregationType::Max);
    create_subscription_timewindow(&tw, now_ms, 0).unwrap()
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_replay_becomes_snapshot() {
    let (service, mut opened) = service();
    let (_widget, mut events) =
        WidgetSubscription::spawn(&service, request(), Some(window(1_000_000))).unwrap();

    let mut socket = opened.recv().await.unwrap();
    socket.events.send(SocketEvent::Opened).unwrap();
    let frame = socket.frame().await;
    let cmd = &frame.ts_sub_cmds[0];
    assert_eq!(cmd.start_ts, Some(990_000));
    assert_eq!(cmd.agg, Some(AggregationType::Max));

    // Nothing is rendered before the server replays the window
    let mut next = tokio_test::task::spawn(events.recv());
    tokio_test::assert_pending!(next.poll());
    drop(next);

    socket.push(&json!({
        "subscriptionId": cmd.cmd_id,
        "data": { "temperature": [[995_500, "19.5"], [996_500, 20]] }
    }));

    match events.recv().await.unwrap() {
        WidgetEvent::Snapshot { snapshot, .. } => {
            assert_eq!(
                snapshot["temperature"],
                vec![
                    (995_500, SampleValue::Number(19.5)),
                    (996_500, SampleValue::Number(20.0)),
                ]
            );
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_window_change_resubscribes() {
    let (service, mut opened) = service();
    let (widget, _events) =
        WidgetSubscription::spawn(&service, request(), Some(window(1_000_000))).unwrap();

    let mut socket = opened.recv().await.unwrap();
    socket.events.send(SocketEvent::Opened).unwrap();
    socket.frame().await;

    widget.update_timewindow(window(2_000_000));

    let unsubscribe = socket.frame().await;
    assert!(unsubscribe.ts_sub_cmds[0].unsubscribe);
    assert_eq!(unsubscribe.ts_sub_cmds[0].start_ts, Some(990_000));

    let resubscribe = socket.frame().await;
    assert!(!resubscribe.ts_sub_cmds[0].unsubscribe);
    assert_eq!(resubscribe.ts_sub_cmds[0].start_ts, Some(1_990_000));
}

#[tokio::test(start_paused = true)]
async fn test_dropping_widget_unsubscribes() {
    let (service, mut opened) = service();
    let (widget, mut events) =
        WidgetSubscription::spawn(&service, request(), Some(window(1_000_000))).unwrap();

    let mut socket = opened.recv().await.unwrap();
    socket.events.send(SocketEvent::Opened).unwrap();
    socket.frame().await;

    drop(widget);

    let frame = socket.frame().await;
    assert!(frame.ts_sub_cmds[0].unsubscribe);
    assert!(events.recv().await.is_none());
}
