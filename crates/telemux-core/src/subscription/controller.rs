// ── Subscription controller ──
//
// One live view: builds the commands for a data request, owns the
// aggregator for timeseries views, and relays results to the renderer as
// `WidgetEvent`s. Sans-IO like the aggregator; `WidgetSubscription` drives
// it against a `TelemetryService`.

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use telemux_api::telemetry::{
    AttributeData, AttributeScope, AttributesSubscriptionCmd, EntityRef, GetHistoryCmd,
    SubscriptionData, TelemetryCommand, TimeseriesSubscriptionCmd,
};

use super::timewindow::SubscriptionTimewindow;
use crate::aggregation::{DataAggregator, DataCallback, Snapshot};
use crate::error::CoreError;
use crate::mux::SubscriberEvent;

/// What kind of data a view wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    /// Aggregated series over a time window.
    Timeseries,
    /// Most recent telemetry values, no window.
    LatestTelemetry,
    /// Attribute values in one scope (all scopes when `None`).
    Attributes(Option<AttributeScope>),
}

/// Data request of one view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub entity: EntityRef,
    pub keys: Vec<String>,
    pub kind: DataKind,
    /// Treat series as step functions across window bounds.
    pub state_data: bool,
}

/// What the renderer receives.
#[derive(Debug, Clone, PartialEq)]
pub enum WidgetEvent {
    /// Recomputed timeseries window.
    Snapshot {
        snapshot: Snapshot,
        detect_changes: bool,
    },
    /// Latest telemetry values as delivered.
    Latest(SubscriptionData),
    /// Attribute values, merged across updates.
    Attributes(Vec<AttributeData>),
    /// Connection came back; data restarts from the server's replay.
    Reconnected,
}

pub struct SubscriptionController {
    request: SubscriptionRequest,
    timewindow: Option<SubscriptionTimewindow>,
    aggregator: Option<DataAggregator>,
    attributes: Vec<AttributeData>,
    awaiting_first_data: bool,
    sink: mpsc::UnboundedSender<WidgetEvent>,
    destroyed: bool,
}

impl std::fmt::Debug for SubscriptionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionController")
            .field("request", &self.request)
            .field("timewindow", &self.timewindow)
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

impl SubscriptionController {
    /// Timeseries requests need a window; other kinds ignore it.
    pub fn new(
        request: SubscriptionRequest,
        timewindow: Option<SubscriptionTimewindow>,
        sink: mpsc::UnboundedSender<WidgetEvent>,
        now: Instant,
    ) -> Result<Self, CoreError> {
        if request.keys.is_empty() {
            return Err(CoreError::ValidationFailed {
                message: "at least one key is required".into(),
            });
        }
        let timewindow = match request.kind {
            DataKind::Timeseries => Some(timewindow.ok_or_else(|| CoreError::ValidationFailed {
                message: "timeseries subscriptions need a time window".into(),
            })?),
            DataKind::LatestTelemetry | DataKind::Attributes(_) => None,
        };

        let mut controller = Self {
            request,
            timewindow,
            aggregator: None,
            attributes: Vec::new(),
            awaiting_first_data: true,
            sink,
            destroyed: false,
        };
        controller.aggregator = controller.build_aggregator(now);
        Ok(controller)
    }

    pub fn request(&self) -> &SubscriptionRequest {
        &self.request
    }

    pub fn timewindow(&self) -> Option<&SubscriptionTimewindow> {
        self.timewindow.as_ref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Commands to issue for the current window.
    pub fn commands(&self) -> Vec<TelemetryCommand> {
        let entity = self.request.entity;
        let keys = &self.request.keys;
        let cmd = match (self.request.kind, self.timewindow) {
            (DataKind::Attributes(scope), _) => TelemetryCommand::AttributeSubscribe(
                AttributesSubscriptionCmd::new(entity, keys, scope),
            ),
            (DataKind::LatestTelemetry, _) | (DataKind::Timeseries, None) => {
                TelemetryCommand::TimeseriesSubscribe(TimeseriesSubscriptionCmd::latest(
                    entity, keys,
                ))
            }
            (DataKind::Timeseries, Some(tw)) => match tw.fixed_window {
                Some((start, end)) => TelemetryCommand::HistoryFetch(GetHistoryCmd::new(
                    entity,
                    keys,
                    start,
                    end,
                    tw.interval,
                    tw.limit,
                    tw.agg,
                )),
                None => TelemetryCommand::TimeseriesSubscribe(TimeseriesSubscriptionCmd::windowed(
                    entity,
                    keys,
                    tw.start_ts,
                    tw.time_window,
                    tw.interval,
                    tw.limit,
                    tw.agg,
                )),
            },
        };
        vec![cmd]
    }

    /// When the aggregator wants its next tick.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.aggregator.as_ref().and_then(DataAggregator::next_deadline)
    }

    pub fn on_tick(&mut self, now: Instant) {
        if let Some(aggregator) = self.aggregator.as_mut() {
            aggregator.on_timer(now);
        }
    }

    pub fn on_event(&mut self, event: SubscriberEvent, now: Instant) {
        if self.destroyed {
            return;
        }
        match event {
            SubscriberEvent::Data { update, .. } => self.on_data(update.data, now),
            SubscriberEvent::Reconnected => {
                debug!(entity = %self.request.entity.entity_id, "view reconnected");
                self.restart_window(now);
                self.emit(WidgetEvent::Reconnected);
            }
        }
    }

    /// Switch to a new window. Returns the commands to subscribe with;
    /// the caller drops the previous subscription.
    pub fn update_timewindow(
        &mut self,
        timewindow: SubscriptionTimewindow,
        now: Instant,
    ) -> Vec<TelemetryCommand> {
        if self.request.kind != DataKind::Timeseries || self.destroyed {
            return self.commands();
        }
        let same_shape = self
            .timewindow
            .is_some_and(|old| old.agg == timewindow.agg && old.limit == timewindow.limit);
        self.timewindow = Some(timewindow);

        match self.aggregator.as_mut().filter(|_| same_shape) {
            Some(aggregator) => aggregator.reset(
                timewindow.start_ts,
                timewindow.time_window,
                timewindow.interval,
                now,
            ),
            None => {
                if let Some(mut old) = self.aggregator.take() {
                    old.destroy();
                }
                self.aggregator = self.build_aggregator(now);
            }
        }
        self.awaiting_first_data = true;
        self.commands()
    }

    /// Stop the aggregator and emit nothing further. Idempotent.
    pub fn destroy(&mut self) {
        if let Some(aggregator) = self.aggregator.as_mut() {
            aggregator.destroy();
        }
        self.aggregator = None;
        self.destroyed = true;
    }

    // ── Internals ────────────────────────────────────────────────────

    fn build_aggregator(&self, now: Instant) -> Option<DataAggregator> {
        let tw = self.timewindow?;
        let sink = self.sink.clone();
        let callback: DataCallback = Box::new(move |snapshot, detect_changes| {
            let _ = sink.send(WidgetEvent::Snapshot {
                snapshot: snapshot.clone(),
                detect_changes,
            });
        });
        Some(DataAggregator::new(
            self.request.keys.clone(),
            tw.window_spec(self.request.state_data),
            callback,
            now,
        ))
    }

    fn on_data(&mut self, data: SubscriptionData, now: Instant) {
        match self.request.kind {
            DataKind::Timeseries => {
                let history = self.timewindow.is_some_and(|tw| !tw.is_realtime());
                // The first frame after (re)subscribing is the server's
                // aggregated replay; later frames carry raw samples.
                let update = !self.awaiting_first_data;
                self.awaiting_first_data = false;
                if let Some(aggregator) = self.aggregator.as_mut() {
                    trace!(keys = data.len(), update, history, "feeding aggregator");
                    aggregator.on_data(&data, update, history, true, now);
                }
            }
            DataKind::LatestTelemetry => self.emit(WidgetEvent::Latest(data)),
            DataKind::Attributes(_) => {
                let update = telemux_api::telemetry::SubscriptionUpdate {
                    data,
                    ..Default::default()
                };
                update.update_attribute_data(&mut self.attributes);
                self.emit(WidgetEvent::Attributes(self.attributes.clone()));
            }
        }
    }

    fn restart_window(&mut self, now: Instant) {
        self.awaiting_first_data = true;
        if let Some(aggregator) = self.aggregator.as_mut() {
            let window = aggregator.window().clone();
            aggregator.reset(window.start_ts, window.time_window, window.interval, now);
        }
    }

    fn emit(&self, event: WidgetEvent) {
        if self.sink.send(event).is_err() {
            trace!("renderer gone, event dropped");
        }
    }
}
