//! `telemux history`: aggregate a fixed window, optionally next to the same
//! window one calendar unit earlier.

use std::time::Duration;

use tracing::debug;

use telemux_core::subscription::{create_subscription_timewindow, create_timewindow_for_comparison};
use telemux_core::{
    DataKind, Snapshot, SubscriptionTimewindow, TelemetryService, Timewindow, WidgetEvent,
    WidgetSubscription,
};

use super::util;
use crate::cli::{EntityArgs, GlobalOpts, HistoryArgs};
use crate::error::CliError;
use crate::output;

pub async fn handle(
    service: &TelemetryService,
    args: HistoryArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let now = util::now_ms();
    let (start, end) = match (args.start, args.end) {
        (Some(start), Some(end)) => (start, end),
        _ => (now.saturating_sub(util::duration_ms(args.last)), now),
    };
    let tw = util::with_aggregation(Timewindow::fixed(start, end), &args.aggregation);
    let window = create_subscription_timewindow(&tw, now, 0)?;
    let state_data = args.aggregation.state_data;

    let snapshot = match args.compare {
        None => fetch_window(service, &args.entity, state_data, window, args.wait).await?,
        Some(unit) => {
            let previous = create_timewindow_for_comparison(&window, unit)?;
            debug!(%unit, start = previous.start_ts, "fetching comparison window");
            let (current, previous) = tokio::try_join!(
                fetch_window(service, &args.entity, state_data, window, args.wait),
                fetch_window(service, &args.entity, state_data, previous, args.wait),
            )?;
            let mut merged = output::label_snapshot("current", &current);
            merged.extend(output::label_snapshot(&format!("previous_{unit}"), &previous));
            merged
        }
    };

    output::print_output(
        &output::render_snapshot(global.output, &snapshot),
        global.quiet,
    );
    Ok(())
}

async fn fetch_window(
    service: &TelemetryService,
    entity: &EntityArgs,
    state_data: bool,
    window: SubscriptionTimewindow,
    wait: Duration,
) -> Result<Snapshot, CliError> {
    let request = util::request(entity, DataKind::Timeseries, state_data);
    let (widget, mut events) = WidgetSubscription::spawn(service, request, Some(window))?;
    let snapshot = util::first_event(&mut events, wait, |event| match event {
        WidgetEvent::Snapshot { snapshot, .. } => Some(snapshot),
        _ => None,
    })
    .await;
    widget.stop();
    snapshot
}
