// ── Aggregation buckets ──
//
// One accumulator per (key, bucket timestamp). Re-inserting into an
// existing bucket folds the sample in with the aggregation function;
// only NONE overwrites.

use telemux_api::telemetry::AggregationType;

use super::value::SampleValue;

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationBucket {
    /// Samples folded in. Seeded from the value itself when rebuilding
    /// from server-side COUNT aggregates, so it may be fractional.
    pub count: f64,
    pub sum: f64,
    pub agg_value: SampleValue,
}

impl AggregationBucket {
    /// First sample of a fresh bucket.
    pub fn first(value: SampleValue, agg: AggregationType) -> Self {
        let sum = value.as_f64().unwrap_or(f64::NAN);
        let agg_value = if agg == AggregationType::Count {
            SampleValue::Number(1.0)
        } else {
            value
        };
        Self {
            count: 1.0,
            sum,
            agg_value,
        }
    }

    /// Bucket rebuilt from a server-aggregated point, keyed by its own
    /// timestamp.
    pub fn from_aggregate(value: SampleValue, agg: AggregationType) -> Self {
        let n = value.as_f64().unwrap_or(f64::NAN);
        Self {
            count: if agg == AggregationType::Count { n } else { 1.0 },
            sum: n,
            agg_value: value,
        }
    }

    /// Fold another sample into this bucket.
    pub fn merge(&mut self, value: SampleValue, agg: AggregationType) {
        let current = self.agg_value.as_f64().unwrap_or(f64::NAN);
        let v = value.as_f64().unwrap_or(f64::NAN);
        match agg {
            AggregationType::Avg => {
                self.count += 1.0;
                self.sum += v;
                self.agg_value = SampleValue::Number(self.sum / self.count);
            }
            AggregationType::Min => self.agg_value = SampleValue::Number(current.min(v)),
            AggregationType::Max => self.agg_value = SampleValue::Number(current.max(v)),
            AggregationType::Sum => self.agg_value = SampleValue::Number(current + v),
            AggregationType::Count => {
                self.count += 1.0;
                self.agg_value = SampleValue::Number(self.count);
            }
            AggregationType::None => self.agg_value = value,
        }
    }
}

/// Timestamp of the bucket a sample at `ts` belongs to.
///
/// Without aggregation the sample keeps its own timestamp. Otherwise it
/// lands on the midpoint of its `interval`-wide slot counted from
/// `start_ts`.
pub fn bucket_ts(ts: i64, start_ts: i64, interval: i64, agg: AggregationType) -> i64 {
    if agg == AggregationType::None {
        return ts;
    }
    let interval = interval.max(1);
    let slot = ts.saturating_sub(start_ts).div_euclid(interval);
    start_ts
        .saturating_add(slot.saturating_mul(interval))
        .saturating_add(interval / 2)
}
