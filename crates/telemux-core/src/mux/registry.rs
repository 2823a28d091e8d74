// ── Subscriber registry ──
//
// cmd_id → (subscriber, index of the command within that subscriber).
// Ids are handed out in increasing order, so iteration order matches
// subscribe order.

use std::collections::BTreeMap;

use super::SubscriberId;

#[derive(Debug, Default, Clone)]
pub struct SubscriberRegistry {
    entries: BTreeMap<i32, (SubscriberId, usize)>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, cmd_id: i32, subscriber: SubscriberId, command_index: usize) {
        self.entries.insert(cmd_id, (subscriber, command_index));
    }

    pub fn lookup(&self, cmd_id: i32) -> Option<(SubscriberId, usize)> {
        self.entries.get(&cmd_id).copied()
    }

    pub fn unregister(&mut self, cmd_id: i32) -> Option<(SubscriberId, usize)> {
        self.entries.remove(&cmd_id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
