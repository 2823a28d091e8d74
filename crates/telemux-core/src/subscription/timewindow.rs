// ── Subscription time windows ──
//
// Turns a caller-facing time range into the concrete window a telemetry
// subscription and its aggregator work with.

use chrono::{DateTime, Duration as ChronoDuration, Months, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use telemux_api::telemetry::AggregationType;

use crate::aggregation::WindowSpec;
use crate::aggregation::window::DEFAULT_INTERVAL_MS;
use crate::error::CoreError;

/// Range requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum TimeRange {
    /// Trailing window that slides with the clock.
    Realtime { window_ms: i64 },
    /// Historical window with constant bounds.
    Fixed { start_ms: i64, end_ms: i64 },
}

/// Caller-facing time window plus aggregation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timewindow {
    pub range: TimeRange,
    /// Aggregation interval; 1000 ms when unset or non-positive.
    pub interval_ms: Option<i64>,
    pub limit: usize,
    pub agg: AggregationType,
}

impl Timewindow {
    pub fn realtime(window_ms: i64) -> Self {
        Self {
            range: TimeRange::Realtime { window_ms },
            interval_ms: None,
            limit: 200,
            agg: AggregationType::default(),
        }
    }

    pub fn fixed(start_ms: i64, end_ms: i64) -> Self {
        Self {
            range: TimeRange::Fixed { start_ms, end_ms },
            ..Self::realtime(0)
        }
    }

    pub fn with_interval(mut self, interval_ms: i64) -> Self {
        self.interval_ms = Some(interval_ms);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_agg(mut self, agg: AggregationType) -> Self {
        self.agg = agg;
        self
    }
}

/// Concrete window of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionTimewindow {
    pub start_ts: i64,
    /// Span the aggregator covers, starting at `start_ts`.
    pub time_window: i64,
    /// `Some((start, end))` for a fixed window, `None` when realtime.
    pub fixed_window: Option<(i64, i64)>,
    pub interval: i64,
    pub limit: usize,
    pub agg: AggregationType,
}

impl SubscriptionTimewindow {
    pub fn is_realtime(&self) -> bool {
        self.fixed_window.is_none()
    }

    pub fn end_ts(&self) -> i64 {
        self.start_ts + self.time_window
    }

    pub fn window_spec(&self, state_data: bool) -> WindowSpec {
        WindowSpec::new(
            self.start_ts,
            self.time_window,
            self.interval,
            self.limit,
            self.agg,
            state_data,
        )
    }
}

/// Compute the window for a subscription starting now.
///
/// `st_diff` is the server clock minus the local clock, in ms. A realtime
/// start is aligned down to the interval; when that moves it, the window
/// grows by one interval so it still reaches the present.
pub fn create_subscription_timewindow(
    timewindow: &Timewindow,
    now_ms: i64,
    st_diff: i64,
) -> Result<SubscriptionTimewindow, CoreError> {
    let interval = timewindow
        .interval_ms
        .filter(|i| *i > 0)
        .unwrap_or(DEFAULT_INTERVAL_MS);

    match timewindow.range {
        TimeRange::Realtime { window_ms } => {
            if window_ms <= 0 {
                return Err(CoreError::ValidationFailed {
                    message: format!("realtime window must be positive, got {window_ms} ms"),
                });
            }
            let start = now_ms + st_diff - window_ms;
            let misalignment = start.rem_euclid(interval);
            let time_window = if misalignment == 0 {
                window_ms
            } else {
                window_ms + interval
            };
            Ok(SubscriptionTimewindow {
                start_ts: start - misalignment,
                time_window,
                fixed_window: None,
                interval,
                limit: timewindow.limit,
                agg: timewindow.agg,
            })
        }
        TimeRange::Fixed { start_ms, end_ms } => {
            if end_ms <= start_ms {
                return Err(CoreError::ValidationFailed {
                    message: format!("window end {end_ms} is not after start {start_ms}"),
                });
            }
            Ok(SubscriptionTimewindow {
                start_ts: start_ms,
                time_window: end_ms - start_ms,
                fixed_window: Some((start_ms, end_ms)),
                interval,
                limit: timewindow.limit,
                agg: timewindow.agg,
            })
        }
    }
}

/// Calendar unit a comparison window is shifted back by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ComparisonUnit {
    Day,
    Week,
    Month,
    Year,
}

fn shift_back(ts_ms: i64, unit: ComparisonUnit) -> Option<i64> {
    let at: DateTime<Utc> = DateTime::from_timestamp_millis(ts_ms)?;
    let shifted = match unit {
        ComparisonUnit::Day => at.checked_sub_signed(ChronoDuration::days(1)),
        ComparisonUnit::Week => at.checked_sub_signed(ChronoDuration::weeks(1)),
        ComparisonUnit::Month => at.checked_sub_months(Months::new(1)),
        ComparisonUnit::Year => at.checked_sub_months(Months::new(12)),
    }?;
    Some(shifted.timestamp_millis())
}

/// The same window one calendar `unit` earlier, for side-by-side display.
///
/// Fixed windows shift both ends; realtime windows keep their span.
pub fn create_timewindow_for_comparison(
    window: &SubscriptionTimewindow,
    unit: ComparisonUnit,
) -> Result<SubscriptionTimewindow, CoreError> {
    let out_of_range = || CoreError::ValidationFailed {
        message: format!("cannot shift window at {} back one {unit}", window.start_ts),
    };

    let start_ts = shift_back(window.start_ts, unit).ok_or_else(out_of_range)?;
    match window.fixed_window {
        None => Ok(SubscriptionTimewindow {
            start_ts,
            ..*window
        }),
        Some((_, end)) => {
            let end_ts = shift_back(end, unit).ok_or_else(out_of_range)?;
            Ok(SubscriptionTimewindow {
                start_ts,
                time_window: end_ts - start_ts,
                fixed_window: Some((start_ts, end_ts)),
                ..*window
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn ms(y: i32, m: u32, d: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap().timestamp_millis()
    }

    #[test]
    fn realtime_start_is_aligned_to_interval() {
        let tw = Timewindow::realtime(60_000).with_interval(1_000);
        let sub = create_subscription_timewindow(&tw, 1_000_500, 0).unwrap();

        assert_eq!(sub.start_ts, 940_000);
        assert_eq!(sub.time_window, 61_000);
        assert!(sub.is_realtime());
        assert_eq!(sub.end_ts(), 1_001_000);
    }

    #[test]
    fn aligned_realtime_start_keeps_window() {
        let tw = Timewindow::realtime(60_000).with_interval(5_000);
        let sub = create_subscription_timewindow(&tw, 1_000_000, 0).unwrap();

        assert_eq!(sub.start_ts, 940_000);
        assert_eq!(sub.time_window, 60_000);
        assert_eq!(sub.interval, 5_000);
    }

    #[test]
    fn server_time_difference_shifts_realtime_start() {
        let tw = Timewindow::realtime(10_000);
        let sub = create_subscription_timewindow(&tw, 100_000, 2_000).unwrap();

        assert_eq!(sub.start_ts, 92_000);
        assert_eq!(sub.interval, DEFAULT_INTERVAL_MS);
    }

    #[test]
    fn fixed_window_keeps_bounds() {
        let tw = Timewindow::fixed(10_000, 70_000)
            .with_interval(0)
            .with_agg(AggregationType::Max);
        let sub = create_subscription_timewindow(&tw, 999_999, 5_000).unwrap();

        assert_eq!(sub.start_ts, 10_000);
        assert_eq!(sub.time_window, 60_000);
        assert_eq!(sub.fixed_window, Some((10_000, 70_000)));
        assert_eq!(sub.interval, DEFAULT_INTERVAL_MS);
        assert_eq!(sub.agg, AggregationType::Max);
    }

    #[test]
    fn inverted_or_empty_windows_are_rejected() {
        assert!(create_subscription_timewindow(&Timewindow::fixed(5, 5), 0, 0).is_err());
        assert!(create_subscription_timewindow(&Timewindow::realtime(0), 0, 0).is_err());
    }

    #[test]
    fn comparison_shifts_fixed_window_by_calendar_unit() {
        let tw = Timewindow::fixed(ms(2024, 3, 15), ms(2024, 3, 16));
        let sub = create_subscription_timewindow(&tw, 0, 0).unwrap();

        let month = create_timewindow_for_comparison(&sub, ComparisonUnit::Month).unwrap();
        assert_eq!(month.fixed_window, Some((ms(2024, 2, 15), ms(2024, 2, 16))));
        assert_eq!(month.time_window, 86_400_000);

        let year = create_timewindow_for_comparison(&sub, ComparisonUnit::Year).unwrap();
        assert_eq!(year.start_ts, ms(2023, 3, 15));

        let week = create_timewindow_for_comparison(&sub, ComparisonUnit::Week).unwrap();
        assert_eq!(week.start_ts, ms(2024, 3, 8));
    }

    #[test]
    fn comparison_keeps_realtime_span() {
        let tw = Timewindow::realtime(3_600_000);
        let sub = create_subscription_timewindow(&tw, ms(2024, 6, 2), 0).unwrap();

        let day = create_timewindow_for_comparison(&sub, ComparisonUnit::Day).unwrap();
        assert_eq!(day.start_ts, sub.start_ts - 86_400_000);
        assert_eq!(day.time_window, sub.time_window);
        assert!(day.is_realtime());
    }

    #[test]
    fn comparison_unit_parses_case_insensitively() {
        assert_eq!("Week".parse::<ComparisonUnit>().unwrap(), ComparisonUnit::Week);
        assert_eq!(ComparisonUnit::Year.to_string(), "year");
    }
}
