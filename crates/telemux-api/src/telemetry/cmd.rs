// ── Outbound telemetry plugin commands ──
//
// Typed versions of the subscribe / history / unsubscribe commands the
// telemetry plugin accepts. Routing into the right outbound array is an
// exhaustive match on `TelemetryCommand`, never a runtime type probe.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Kind of entity a subscription targets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum EntityType {
    Tenant,
    Customer,
    User,
    Dashboard,
    Asset,
    Device,
    EntityView,
    Alarm,
}

/// Attribute scope for attribute subscriptions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum AttributeScope {
    ClientScope,
    ServerScope,
    SharedScope,
}

/// Server-side aggregation function for timeseries and history commands.
///
/// The same value drives client-side bucketing in the aggregator.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum AggregationType {
    Min,
    Max,
    #[default]
    Avg,
    Sum,
    Count,
    None,
}

/// Which server feature a subscription command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetryFeature {
    Attributes,
    Timeseries,
}

/// Target entity of a command: `{entityType, entityId}` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: Uuid,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, entity_id: Uuid) -> Self {
        Self {
            entity_type,
            entity_id,
        }
    }

    pub fn device(entity_id: Uuid) -> Self {
        Self::new(EntityType::Device, entity_id)
    }
}

fn join_keys(keys: &[String]) -> String {
    keys.join(",")
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(v: &bool) -> bool {
    !*v
}

// ── Command payloads ─────────────────────────────────────────────────

/// Subscribe to (or, with `unsubscribe`, stop) attribute updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributesSubscriptionCmd {
    pub cmd_id: i32,
    #[serde(flatten)]
    pub entity: EntityRef,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub keys: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<AttributeScope>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unsubscribe: bool,
}

impl AttributesSubscriptionCmd {
    pub fn new(entity: EntityRef, keys: &[String], scope: Option<AttributeScope>) -> Self {
        Self {
            cmd_id: 0,
            entity,
            keys: join_keys(keys),
            scope,
            unsubscribe: false,
        }
    }
}

/// Subscribe to timeseries updates.
///
/// Without window fields this is a "latest telemetry" subscription; with
/// `start_ts`/`time_window` the server first replays the window, aggregated
/// per `interval`/`agg`, then streams new samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeseriesSubscriptionCmd {
    pub cmd_id: i32,
    #[serde(flatten)]
    pub entity: EntityRef,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub keys: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agg: Option<AggregationType>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unsubscribe: bool,
}

impl TimeseriesSubscriptionCmd {
    /// Latest-value subscription with no replay window.
    pub fn latest(entity: EntityRef, keys: &[String]) -> Self {
        Self {
            cmd_id: 0,
            entity,
            keys: join_keys(keys),
            start_ts: None,
            time_window: None,
            interval: None,
            limit: None,
            agg: None,
            unsubscribe: false,
        }
    }

    /// Windowed subscription: replay `[start_ts, start_ts + time_window]`
    /// then stream.
    pub fn windowed(
        entity: EntityRef,
        keys: &[String],
        start_ts: i64,
        time_window: i64,
        interval: i64,
        limit: usize,
        agg: AggregationType,
    ) -> Self {
        Self {
            start_ts: Some(start_ts),
            time_window: Some(time_window),
            interval: Some(interval),
            limit: Some(limit),
            agg: Some(agg),
            ..Self::latest(entity, keys)
        }
    }
}

/// One-shot fetch of a fixed historical window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetHistoryCmd {
    pub cmd_id: i32,
    #[serde(flatten)]
    pub entity: EntityRef,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub keys: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub interval: i64,
    pub limit: usize,
    pub agg: AggregationType,
}

impl GetHistoryCmd {
    pub fn new(
        entity: EntityRef,
        keys: &[String],
        start_ts: i64,
        end_ts: i64,
        interval: i64,
        limit: usize,
        agg: AggregationType,
    ) -> Self {
        Self {
            cmd_id: 0,
            entity,
            keys: join_keys(keys),
            start_ts,
            end_ts,
            interval,
            limit,
            agg,
        }
    }
}

/// A subscription being torn down. Carries the original command with
/// `unsubscribe = true` so it lands in the same outbound array.
#[derive(Debug, Clone, PartialEq)]
pub enum UnsubscribeCmd {
    Attributes(AttributesSubscriptionCmd),
    Timeseries(TimeseriesSubscriptionCmd),
}

// ── TelemetryCommand ─────────────────────────────────────────────────

/// Every command a subscriber can issue over the telemetry connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryCommand {
    AttributeSubscribe(AttributesSubscriptionCmd),
    TimeseriesSubscribe(TimeseriesSubscriptionCmd),
    HistoryFetch(GetHistoryCmd),
    Unsubscribe(UnsubscribeCmd),
}

impl TelemetryCommand {
    /// Correlation id assigned by the multiplexer (0 = unassigned).
    pub fn cmd_id(&self) -> i32 {
        match self {
            Self::AttributeSubscribe(c) | Self::Unsubscribe(UnsubscribeCmd::Attributes(c)) => {
                c.cmd_id
            }
            Self::TimeseriesSubscribe(c) | Self::Unsubscribe(UnsubscribeCmd::Timeseries(c)) => {
                c.cmd_id
            }
            Self::HistoryFetch(c) => c.cmd_id,
        }
    }

    pub fn set_cmd_id(&mut self, cmd_id: i32) {
        match self {
            Self::AttributeSubscribe(c) | Self::Unsubscribe(UnsubscribeCmd::Attributes(c)) => {
                c.cmd_id = cmd_id;
            }
            Self::TimeseriesSubscribe(c) | Self::Unsubscribe(UnsubscribeCmd::Timeseries(c)) => {
                c.cmd_id = cmd_id;
            }
            Self::HistoryFetch(c) => c.cmd_id = cmd_id,
        }
    }

    /// Comma-joined key list as sent on the wire.
    pub fn keys(&self) -> &str {
        match self {
            Self::AttributeSubscribe(c) | Self::Unsubscribe(UnsubscribeCmd::Attributes(c)) => {
                &c.keys
            }
            Self::TimeseriesSubscribe(c) | Self::Unsubscribe(UnsubscribeCmd::Timeseries(c)) => {
                &c.keys
            }
            Self::HistoryFetch(c) => &c.keys,
        }
    }

    /// Individual key names, empty when the command targets all keys.
    pub fn key_list(&self) -> Vec<String> {
        self.keys()
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn feature(&self) -> TelemetryFeature {
        match self {
            Self::AttributeSubscribe(_) | Self::Unsubscribe(UnsubscribeCmd::Attributes(_)) => {
                TelemetryFeature::Attributes
            }
            Self::TimeseriesSubscribe(_)
            | Self::HistoryFetch(_)
            | Self::Unsubscribe(UnsubscribeCmd::Timeseries(_)) => TelemetryFeature::Timeseries,
        }
    }

    /// The request that tells the server to stop this subscription.
    ///
    /// History fetches are one-shot and have nothing to cancel.
    pub fn unsubscribe_request(&self) -> Option<TelemetryCommand> {
        match self {
            Self::AttributeSubscribe(c) => Some(Self::Unsubscribe(UnsubscribeCmd::Attributes(
                AttributesSubscriptionCmd {
                    unsubscribe: true,
                    ..c.clone()
                },
            ))),
            Self::TimeseriesSubscribe(c) => Some(Self::Unsubscribe(UnsubscribeCmd::Timeseries(
                TimeseriesSubscriptionCmd {
                    unsubscribe: true,
                    ..c.clone()
                },
            ))),
            Self::HistoryFetch(_) | Self::Unsubscribe(_) => None,
        }
    }
}
