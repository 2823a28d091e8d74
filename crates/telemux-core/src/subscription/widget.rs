// ── Widget subscription task ──
//
// Runs one `SubscriptionController` against the shared `TelemetryService`:
// subscriber events, aggregator ticks and window changes are handled in
// one loop, so the aggregator never sees data and a tick concurrently.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::controller::{SubscriptionController, WidgetEvent};
use super::timewindow::SubscriptionTimewindow;
use crate::error::CoreError;
use crate::mux::service::sleep_until_deadline;
use crate::mux::{Subscription, TelemetryService};

enum Control {
    UpdateTimewindow(SubscriptionTimewindow),
    Stop,
}

/// Handle to a running view. Dropping it stops the view.
#[derive(Debug)]
pub struct WidgetSubscription {
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl WidgetSubscription {
    /// Subscribe the controller's commands and start relaying.
    pub fn start(
        service: &TelemetryService,
        controller: SubscriptionController,
    ) -> Result<Self, CoreError> {
        let subscription = service.subscribe(controller.commands())?;
        let (control, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(service.clone(), controller, subscription, control_rx));
        Ok(Self { control, task })
    }

    /// Convenience: build a controller that reports into a fresh channel.
    pub fn spawn(
        service: &TelemetryService,
        request: super::SubscriptionRequest,
        timewindow: Option<SubscriptionTimewindow>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WidgetEvent>), CoreError> {
        let (sink, events) = mpsc::unbounded_channel();
        let controller = SubscriptionController::new(request, timewindow, sink, Instant::now())?;
        Ok((Self::start(service, controller)?, events))
    }

    /// Move the view to a new window and resubscribe.
    pub fn update_timewindow(&self, timewindow: SubscriptionTimewindow) {
        let _ = self.control.send(Control::UpdateTimewindow(timewindow));
    }

    /// Unsubscribe and stop. Safe to call repeatedly.
    pub fn stop(&self) {
        let _ = self.control.send(Control::Stop);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for WidgetSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    service: TelemetryService,
    mut controller: SubscriptionController,
    mut subscription: Subscription,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    loop {
        let deadline = controller.next_deadline();
        tokio::select! {
            biased;

            ctl = control.recv() => match ctl {
                Some(Control::UpdateTimewindow(tw)) => {
                    let commands = controller.update_timewindow(tw, Instant::now());
                    subscription.unsubscribe();
                    match service.subscribe(commands) {
                        Ok(next) => subscription = next,
                        Err(e) => {
                            warn!(error = %e, "resubscribe failed");
                            break;
                        }
                    }
                }
                Some(Control::Stop) | None => break,
            },
            event = subscription.recv() => match event {
                Some(event) => controller.on_event(event, Instant::now()),
                None => {
                    debug!(subscriber = subscription.id(), "subscription dropped by service");
                    break;
                }
            },
            () = sleep_until_deadline(deadline) => controller.on_tick(Instant::now()),
        }
    }
    subscription.unsubscribe();
    controller.destroy();
}
