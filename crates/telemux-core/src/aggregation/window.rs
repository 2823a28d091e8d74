// ── Window bounds and snapshot helpers ──

use std::collections::BTreeMap;
use std::time::Duration;

use telemux_api::telemetry::AggregationType;

use super::bucket::AggregationBucket;
use super::value::SampleValue;

/// Interval used when a caller passes a non-positive one.
pub const DEFAULT_INTERVAL_MS: i64 = 1_000;
/// Floor for the recompute period.
pub const MIN_TICK_MS: i64 = 1_000;

pub type Point = (i64, SampleValue);

/// Time window one aggregator covers. `end_ts` is always derived.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSpec {
    pub start_ts: i64,
    pub time_window: i64,
    pub interval: i64,
    pub limit: usize,
    pub agg: AggregationType,
    pub state_data: bool,
}

impl WindowSpec {
    pub fn new(
        start_ts: i64,
        time_window: i64,
        interval: i64,
        limit: usize,
        agg: AggregationType,
        state_data: bool,
    ) -> Self {
        Self {
            start_ts,
            time_window,
            interval: sanitize_interval(interval),
            limit,
            agg,
            state_data,
        }
    }

    pub fn end_ts(&self) -> i64 {
        self.start_ts + self.time_window
    }

    /// Period of the recompute timer: the interval, but never under 1s.
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.interval.max(MIN_TICK_MS).unsigned_abs())
    }

    pub fn interval_duration(&self) -> Duration {
        Duration::from_millis(self.interval.unsigned_abs())
    }
}

pub(crate) fn sanitize_interval(interval: i64) -> i64 {
    if interval > 0 {
        interval
    } else {
        DEFAULT_INTERVAL_MS
    }
}

/// Remove every bucket at or before `start_ts` and hand them back.
pub fn evict_through(
    buckets: &mut BTreeMap<i64, AggregationBucket>,
    start_ts: i64,
) -> BTreeMap<i64, AggregationBucket> {
    let kept = buckets.split_off(&start_ts.saturating_add(1));
    std::mem::replace(buckets, kept)
}

/// New "last value before the window" for a key, given what was just
/// evicted. Returns `None` when `current` is still the most recent.
pub fn latest_before_window(
    evicted: &BTreeMap<i64, AggregationBucket>,
    current: Option<&Point>,
) -> Option<Point> {
    let (ts, bucket) = evicted.last_key_value()?;
    match current {
        Some((prev_ts, _)) if prev_ts >= ts => None,
        _ => Some((*ts, bucket.agg_value.clone())),
    }
}

/// Stretch a state series over the whole window.
///
/// The last value seen before the window is re-stamped to `start_ts` and
/// put in front when nothing covers the start. The final point is
/// repeated at `end_ts` when it falls short of the end.
pub fn extend_state_bounds(
    series: &mut Vec<Point>,
    last_prev: Option<&Point>,
    start_ts: i64,
    end_ts: i64,
) {
    let prev = last_prev.map(|(_, v)| (start_ts, v.clone()));
    match (series.first(), prev) {
        (None, Some(p)) => series.push(p),
        (Some((first_ts, _)), Some(p)) if *first_ts > start_ts => series.insert(0, p),
        _ => {}
    }
    if let Some((last_ts, last_value)) = series.last() {
        if *last_ts < end_ts {
            let tail = (end_ts, last_value.clone());
            series.push(tail);
        }
    }
}

/// Keep only the most recent `limit` points.
pub fn trim_to_limit(series: &mut Vec<Point>, limit: usize) {
    if series.len() > limit {
        series.drain(..series.len() - limit);
    }
}
