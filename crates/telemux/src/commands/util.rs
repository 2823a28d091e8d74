//! Shared helpers for the streaming commands.

use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use telemux_core::{
    DataKind, EntityRef, SubscriptionRequest, Timewindow, WidgetEvent, WsNotice,
};

use crate::cli::{AggregationArgs, EntityArgs};
use crate::error::CliError;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

pub fn request(entity: &EntityArgs, kind: DataKind, state_data: bool) -> SubscriptionRequest {
    SubscriptionRequest {
        entity: EntityRef::new(entity.entity_type, entity.entity_id),
        keys: entity.keys.clone(),
        kind,
        state_data,
    }
}

/// Apply `--agg`, `--interval` and `--limit` to a window.
pub fn with_aggregation(tw: Timewindow, args: &AggregationArgs) -> Timewindow {
    let tw = tw.with_agg(args.agg).with_limit(args.limit);
    match args.interval {
        Some(interval) => tw.with_interval(duration_ms(interval)),
        None => tw,
    }
}

/// Next user-visible websocket error. Pends forever once the service is gone.
pub async fn next_notice(notices: &mut broadcast::Receiver<WsNotice>) -> WsNotice {
    loop {
        match notices.recv().await {
            Ok(notice) => return notice,
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "notices lagged"),
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

pub fn report_notice(notice: &WsNotice, quiet: bool) {
    if !quiet {
        eprintln!("{notice}");
    }
}

/// Resolves on Ctrl-C, or after `limit` when given.
pub async fn interrupted(limit: Option<Duration>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    match limit {
        Some(limit) => {
            tokio::select! {
                () = ctrl_c => {}
                () = tokio::time::sleep(limit) => {}
            }
        }
        None => ctrl_c.await,
    }
}

/// Wait up to `wait` for the first event `pick` accepts.
pub async fn first_event<T>(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<WidgetEvent>,
    wait: Duration,
    mut pick: impl FnMut(WidgetEvent) -> Option<T>,
) -> Result<T, CliError> {
    let found = tokio::time::timeout(wait, async {
        while let Some(event) = events.recv().await {
            if let Some(value) = pick(event) {
                return Some(value);
            }
        }
        None
    })
    .await;

    match found {
        Ok(Some(value)) => Ok(value),
        Ok(None) => Err(CliError::Disconnected),
        Err(_) => Err(CliError::Timeout {
            waited: humantime::format_duration(wait).to_string(),
        }),
    }
}
