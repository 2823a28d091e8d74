//! `telemux watch`: realtime aggregated window, printed on every change.
//!
//! With `--compare` a second realtime window, shifted back one calendar
//! unit, runs alongside and both are printed with `current` and
//! `previous_<unit>` labels.

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

use telemux_core::subscription::{create_subscription_timewindow, create_timewindow_for_comparison};
use telemux_core::{
    ComparisonUnit, DataKind, Snapshot, TelemetryService, Timewindow, WidgetEvent,
    WidgetSubscription,
};

use super::util;
use crate::cli::{GlobalOpts, WatchArgs};
use crate::error::CliError;
use crate::output;

pub async fn handle(
    service: &TelemetryService,
    args: WatchArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let tw = util::with_aggregation(
        Timewindow::realtime(util::duration_ms(args.window)),
        &args.aggregation,
    );
    let window = create_subscription_timewindow(&tw, util::now_ms(), 0)?;
    let request = util::request(
        &args.entity,
        DataKind::Timeseries,
        args.aggregation.state_data,
    );

    let (widget, mut events) = WidgetSubscription::spawn(service, request.clone(), Some(window))?;
    let mut previous = match args.compare {
        Some(unit) => {
            let shifted = create_timewindow_for_comparison(&window, unit)?;
            debug!(%unit, start = shifted.start_ts, "watching comparison window");
            let (widget, events) = WidgetSubscription::spawn(service, request, Some(shifted))?;
            Some((widget, events))
        }
        None => None,
    };

    let mut notices = service.notices();
    let stop = util::interrupted(args.duration);
    tokio::pin!(stop);

    let mut view = WatchView::new(args.compare);
    let result = loop {
        tokio::select! {
            () = &mut stop => break Ok(()),
            event = events.recv() => match event {
                Some(event) => view.current(event, global),
                None => break Err(CliError::Disconnected),
            },
            event = next_previous(previous.as_mut().map(|(_, rx)| rx)) => match event {
                Some(event) => view.previous(event, global),
                None => break Err(CliError::Disconnected),
            },
            notice = util::next_notice(&mut notices) => util::report_notice(&notice, global.quiet),
        }
    };

    widget.stop();
    if let Some((widget, _)) = previous {
        widget.stop();
    }
    result
}

/// Next event of the comparison window. Pends forever without one.
async fn next_previous(events: Option<&mut UnboundedReceiver<WidgetEvent>>) -> Option<WidgetEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

/// Latest snapshot of each window and what was last printed.
struct WatchView {
    compare: Option<ComparisonUnit>,
    current: Option<Snapshot>,
    previous: Option<Snapshot>,
    printed: Option<Snapshot>,
}

impl WatchView {
    fn new(compare: Option<ComparisonUnit>) -> Self {
        Self {
            compare,
            current: None,
            previous: None,
            printed: None,
        }
    }

    fn current(&mut self, event: WidgetEvent, global: &GlobalOpts) {
        if let Some((snapshot, detect_changes)) = Self::snapshot_of(event) {
            self.current = Some(snapshot);
            self.render(detect_changes, global);
        }
    }

    fn previous(&mut self, event: WidgetEvent, global: &GlobalOpts) {
        if let Some((snapshot, detect_changes)) = Self::snapshot_of(event) {
            self.previous = Some(snapshot);
            self.render(detect_changes, global);
        }
    }

    fn snapshot_of(event: WidgetEvent) -> Option<(Snapshot, bool)> {
        match event {
            WidgetEvent::Snapshot {
                snapshot,
                detect_changes,
            } => Some((snapshot, detect_changes)),
            WidgetEvent::Reconnected => {
                info!("reconnected, waiting for replay");
                None
            }
            _ => None,
        }
    }

    /// Snapshot to print, or `None` when a tick changed nothing.
    fn next_output(&mut self, detect_changes: bool) -> Option<Snapshot> {
        let merged = self.merged();
        if detect_changes && self.printed.as_ref() == Some(&merged) {
            return None;
        }
        self.printed = Some(merged.clone());
        Some(merged)
    }

    fn render(&mut self, detect_changes: bool, global: &GlobalOpts) {
        if let Some(snapshot) = self.next_output(detect_changes) {
            output::print_output(
                &output::render_snapshot(global.output, &snapshot),
                global.quiet,
            );
        }
    }

    fn merged(&self) -> Snapshot {
        let Some(unit) = self.compare else {
            return self.current.clone().unwrap_or_default();
        };
        let mut merged = self
            .current
            .as_ref()
            .map(|s| output::label_snapshot("current", s))
            .unwrap_or_default();
        if let Some(previous) = &self.previous {
            merged.extend(output::label_snapshot(&format!("previous_{unit}"), previous));
        }
        merged
    }
}
