// ── Time-window aggregator ──
//
// Turns an unbounded stream of (timestamp, value) samples per key into a
// periodically recomputed, bounded, sorted series per key. Sans-IO: every
// entry point takes the current instant, and the owner sleeps until
// `next_deadline()` and then calls `on_timer`.

pub mod bucket;
pub mod value;
pub mod window;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use telemux_api::telemetry::{AggregationType, SubscriptionData};

pub use bucket::{AggregationBucket, bucket_ts};
pub use value::{SampleValue, coerce, is_numeric_str};
pub use window::{
    Point, WindowSpec, evict_through, extend_state_bounds, latest_before_window, trim_to_limit,
};

/// Emitted series per key, ascending by timestamp.
pub type Snapshot = BTreeMap<String, Vec<Point>>;

/// Receives every recomputed snapshot plus a change-detection hint.
///
/// Panics inside the callback propagate to whoever drove the aggregator.
pub type DataCallback = Box<dyn FnMut(&Snapshot, bool) + Send>;

type BucketMap = HashMap<String, BTreeMap<i64, AggregationBucket>>;

/// Aggregation state for one logical subscription.
pub struct DataAggregator {
    keys: Vec<String>,
    window: WindowSpec,
    callback: Option<DataCallback>,
    buckets: BucketMap,
    last_prev: HashMap<String, Point>,
    snapshot: Option<Snapshot>,
    data_received: bool,
    reset_pending: bool,
    elapsed: Duration,
    scheduled_at: Instant,
    next_tick: Option<Instant>,
}

impl std::fmt::Debug for DataAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataAggregator")
            .field("keys", &self.keys)
            .field("window", &self.window)
            .field("data_received", &self.data_received)
            .field("reset_pending", &self.reset_pending)
            .field("next_tick", &self.next_tick)
            .finish_non_exhaustive()
    }
}

impl DataAggregator {
    pub fn new(keys: Vec<String>, window: WindowSpec, callback: DataCallback, now: Instant) -> Self {
        Self {
            keys,
            window,
            callback: Some(callback),
            buckets: HashMap::new(),
            last_prev: HashMap::new(),
            snapshot: None,
            data_received: false,
            reset_pending: false,
            elapsed: Duration::ZERO,
            scheduled_at: now,
            next_tick: None,
        }
    }

    pub fn window(&self) -> &WindowSpec {
        &self.window
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.callback.is_none()
    }

    /// Aggregated value currently held for one bucket.
    pub fn bucket(&self, key: &str, ts: i64) -> Option<&AggregationBucket> {
        self.buckets.get(key)?.get(&ts)
    }

    /// When the recompute timer fires next, if armed.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_tick
    }

    /// Feed samples in.
    ///
    /// The first delivery (and the first after `reset`) replaces the bucket
    /// map: merged sample by sample when `update` is set, otherwise taken
    /// as already-aggregated points keyed by their own timestamps. Later
    /// deliveries merge. A history fetch recomputes and emits immediately.
    pub fn on_data(
        &mut self,
        data: &SubscriptionData,
        update: bool,
        history: bool,
        detect_changes: bool,
        now: Instant,
    ) {
        if self.is_destroyed() {
            return;
        }

        if !self.data_received || self.reset_pending {
            let mut restart_clock = true;
            if !self.data_received {
                self.elapsed = Duration::ZERO;
                self.data_received = true;
            }
            if self.reset_pending {
                self.reset_pending = false;
                restart_clock = false;
            }
            if update {
                self.buckets.clear();
                self.merge_samples(data);
            } else {
                self.buckets = self.rebuild_from_aggregates(data);
            }
            if restart_clock {
                self.scheduled_at = now;
            }
            self.on_interval(history, detect_changes, now);
        } else {
            self.merge_samples(data);
            if history {
                self.scheduled_at = now;
                self.on_interval(history, detect_changes, now);
            }
        }
    }

    /// Fire the recompute timer if it is due.
    pub fn on_timer(&mut self, now: Instant) {
        if self.next_tick.is_some_and(|at| at <= now) {
            self.on_interval(false, true, now);
        }
    }

    /// Move to a new window. The next delivery rebuilds the bucket map.
    pub fn reset(&mut self, start_ts: i64, time_window: i64, interval: i64, now: Instant) {
        if self.is_destroyed() {
            return;
        }
        self.window.start_ts = start_ts;
        self.window.time_window = time_window;
        self.window.interval = window::sanitize_interval(interval);
        self.scheduled_at = now;
        self.elapsed = Duration::ZERO;
        self.reset_pending = true;
        self.snapshot = None;
        self.next_tick = Some(now + self.window.tick_period());
        trace!(start_ts, time_window, "aggregator reset");
    }

    /// Stop the timer and drop all state. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        self.next_tick = None;
        self.callback = None;
        self.buckets.clear();
        self.last_prev.clear();
        self.snapshot = None;
    }

    // ── Internals ────────────────────────────────────────────────────

    fn on_interval(&mut self, history: bool, detect_changes: bool, now: Instant) {
        self.elapsed += now.saturating_duration_since(self.scheduled_at);
        self.scheduled_at = now;
        self.next_tick = None;

        if history {
            self.snapshot = Some(self.update_data());
        } else {
            let interval = self.window.interval_duration();
            let delta = u32::try_from(self.elapsed.as_nanos() / interval.as_nanos())
                .unwrap_or(u32::MAX);
            if delta > 0 || self.snapshot.is_none() {
                self.window.start_ts += i64::from(delta) * self.window.interval;
                self.elapsed = self.elapsed.saturating_sub(interval * delta);
                self.snapshot = Some(self.update_data());
            }
        }

        if let (Some(callback), Some(snapshot)) = (self.callback.as_mut(), self.snapshot.as_ref()) {
            callback(snapshot, detect_changes);
        }

        if !history {
            self.next_tick = Some(now + self.window.tick_period());
        }
    }

    fn merge_samples(&mut self, data: &SubscriptionData) {
        let WindowSpec {
            start_ts,
            interval,
            agg,
            ..
        } = self.window;
        for (key, samples) in data {
            let key_buckets = self.buckets.entry(key.clone()).or_default();
            for (ts, raw) in samples {
                let value = coerce(raw, agg);
                let slot = bucket_ts(*ts, start_ts, interval, agg);
                match key_buckets.get_mut(&slot) {
                    Some(bucket) => bucket.merge(value, agg),
                    None => {
                        key_buckets.insert(slot, AggregationBucket::first(value, agg));
                    }
                }
            }
        }
    }

    fn rebuild_from_aggregates(&self, data: &SubscriptionData) -> BucketMap {
        let agg = self.window.agg;
        data.iter()
            .map(|(key, samples)| {
                let key_buckets = samples
                    .iter()
                    .map(|(ts, raw)| (*ts, AggregationBucket::from_aggregate(coerce(raw, agg), agg)))
                    .collect();
                (key.clone(), key_buckets)
            })
            .collect()
    }

    /// Evict, collect the in-window points, extend state bounds, trim.
    fn update_data(&mut self) -> Snapshot {
        let start_ts = self.window.start_ts;
        let end_ts = self.window.end_ts();
        let mut snapshot: Snapshot = self.keys.iter().map(|k| (k.clone(), Vec::new())).collect();

        for (key, key_buckets) in &mut self.buckets {
            let evicted = evict_through(key_buckets, start_ts);
            if self.window.state_data {
                if let Some(prev) = latest_before_window(&evicted, self.last_prev.get(key)) {
                    self.last_prev.insert(key.clone(), prev);
                }
            }

            let mut series: Vec<Point> = key_buckets
                .range(..=end_ts)
                .map(|(ts, bucket)| (*ts, bucket.agg_value.clone()))
                .collect();

            if self.window.state_data {
                extend_state_bounds(&mut series, self.last_prev.get(key), start_ts, end_ts);
            }
            trim_to_limit(&mut series, self.window.limit);
            snapshot.insert(key.clone(), series);
        }
        snapshot
    }
}
