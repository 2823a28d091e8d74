//! `telemux latest`: latest telemetry values or attributes.

use telemux_core::{DataKind, TelemetryService, WidgetEvent, WidgetSubscription};

use super::util;
use crate::cli::{GlobalOpts, LatestArgs};
use crate::error::CliError;
use crate::output;

pub async fn handle(
    service: &TelemetryService,
    args: LatestArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let kind = if args.attributes {
        DataKind::Attributes(args.scope)
    } else {
        DataKind::LatestTelemetry
    };
    let request = util::request(&args.entity, kind, false);
    let (widget, mut events) = WidgetSubscription::spawn(service, request, None)?;

    let render = |event: WidgetEvent| match event {
        WidgetEvent::Latest(data) => Some(output::render_samples(global.output, &data)),
        WidgetEvent::Attributes(attrs) => Some(output::render_attributes(global.output, &attrs)),
        WidgetEvent::Snapshot { .. } | WidgetEvent::Reconnected => None,
    };

    if !args.follow {
        let rendered = util::first_event(&mut events, args.wait, render).await;
        widget.stop();
        output::print_output(&rendered?, global.quiet);
        return Ok(());
    }

    let mut notices = service.notices();
    let stop = util::interrupted(None);
    tokio::pin!(stop);
    let result = loop {
        tokio::select! {
            () = &mut stop => break Ok(()),
            event = events.recv() => match event {
                Some(event) => {
                    if let Some(text) = render(event) {
                        output::print_output(&text, global.quiet);
                    }
                }
                None => break Err(CliError::Disconnected),
            },
            notice = util::next_notice(&mut notices) => util::report_notice(&notice, global.quiet),
        }
    };
    widget.stop();
    result
}
