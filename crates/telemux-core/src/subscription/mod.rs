//! Live views over the telemetry connection.
//!
//! A view picks a window ([`timewindow`]), turns it into commands and an
//! aggregator ([`SubscriptionController`]), and runs against the shared
//! [`TelemetryService`](crate::TelemetryService) as a
//! [`WidgetSubscription`].

pub mod controller;
pub mod timewindow;
pub mod widget;

pub use controller::{DataKind, SubscriptionController, SubscriptionRequest, WidgetEvent};
pub use timewindow::{
    ComparisonUnit, SubscriptionTimewindow, TimeRange, Timewindow,
    create_subscription_timewindow, create_timewindow_for_comparison,
};
pub use widget::WidgetSubscription;
