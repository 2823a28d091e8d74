//! Telemetry plugin wire types.
//!
//! Outbound: subscription and history commands, batched into
//! [`CommandFrame`]s. Inbound: [`SubscriptionUpdate`] frames keyed by the
//! command id the subscription was registered under.

pub mod batch;
pub mod cmd;
pub mod update;

pub use batch::{CommandBatch, CommandFrame, MAX_PUBLISH_COMMANDS};
pub use cmd::{
    AggregationType, AttributeScope, AttributesSubscriptionCmd, EntityRef, EntityType,
    GetHistoryCmd, TelemetryCommand, TelemetryFeature, TimeseriesSubscriptionCmd, UnsubscribeCmd,
};
pub use update::{AttributeData, SubscriptionData, SubscriptionUpdate, TsSample};
