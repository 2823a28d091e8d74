// ── Outbound command batching ──
//
// Pending commands wait in three per-kind queues and are flushed into a
// single `{tsSubCmds, historyCmds, attrSubCmds}` frame, capped at a total
// count per frame. Timeseries commands drain first, then history, then
// attributes.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::cmd::{
    AttributesSubscriptionCmd, GetHistoryCmd, TelemetryCommand, TimeseriesSubscriptionCmd,
    UnsubscribeCmd,
};

/// Default cap on commands per outbound frame.
pub const MAX_PUBLISH_COMMANDS: usize = 10;

/// One outbound websocket frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFrame {
    #[serde(default)]
    pub ts_sub_cmds: Vec<TimeseriesSubscriptionCmd>,
    #[serde(default)]
    pub history_cmds: Vec<GetHistoryCmd>,
    #[serde(default)]
    pub attr_sub_cmds: Vec<AttributesSubscriptionCmd>,
}

impl CommandFrame {
    pub fn len(&self) -> usize {
        self.ts_sub_cmds.len() + self.history_cmds.len() + self.attr_sub_cmds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Commands waiting for the next flush.
#[derive(Debug, Default, Clone)]
pub struct CommandBatch {
    ts: VecDeque<TimeseriesSubscriptionCmd>,
    history: VecDeque<GetHistoryCmd>,
    attr: VecDeque<AttributesSubscriptionCmd>,
}

impl CommandBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a command in the array its kind belongs to.
    pub fn enqueue(&mut self, cmd: TelemetryCommand) {
        match cmd {
            TelemetryCommand::TimeseriesSubscribe(c)
            | TelemetryCommand::Unsubscribe(UnsubscribeCmd::Timeseries(c)) => {
                self.ts.push_back(c);
            }
            TelemetryCommand::HistoryFetch(c) => self.history.push_back(c),
            TelemetryCommand::AttributeSubscribe(c)
            | TelemetryCommand::Unsubscribe(UnsubscribeCmd::Attributes(c)) => {
                self.attr.push_back(c);
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.ts.is_empty() || !self.history.is_empty() || !self.attr.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ts.len() + self.history.len() + self.attr.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_pending()
    }

    pub fn clear(&mut self) {
        self.ts.clear();
        self.history.clear();
        self.attr.clear();
    }

    /// Move up to `max` commands into a frame, in priority order.
    ///
    /// Whatever does not fit stays queued for the next flush.
    pub fn flush(&mut self, max: usize) -> CommandFrame {
        let mut frame = CommandFrame::default();
        // A zero cap would never drain the queues.
        let mut budget = max.max(1);

        let take = budget.min(self.ts.len());
        frame.ts_sub_cmds.extend(self.ts.drain(..take));
        budget -= take;

        let take = budget.min(self.history.len());
        frame.history_cmds.extend(self.history.drain(..take));
        budget -= take;

        let take = budget.min(self.attr.len());
        frame.attr_sub_cmds.extend(self.attr.drain(..take));

        frame
    }
}
