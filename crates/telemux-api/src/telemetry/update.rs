// ── Inbound subscription updates ──

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A single `[timestamp, value]` sample as delivered by the server.
pub type TsSample = (i64, Value);

/// Samples per key, each list in the order the server sent them.
pub type SubscriptionData = BTreeMap<String, Vec<TsSample>>;

fn nullable_data<'de, D>(deserializer: D) -> Result<SubscriptionData, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<SubscriptionData>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// One inbound websocket frame.
///
/// A non-zero `error_code` marks a server-side failure for the
/// subscription; `data` is then usually empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionUpdate {
    #[serde(default)]
    pub subscription_id: i32,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub error_msg: Option<String>,
    #[serde(default, deserialize_with = "nullable_data")]
    pub data: SubscriptionData,
}

/// Latest known value of one attribute key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeData {
    pub key: String,
    pub last_update_ts: i64,
    pub value: Value,
}

impl SubscriptionUpdate {
    pub fn is_error(&self) -> bool {
        self.error_code != 0
    }

    /// Make sure every requested key has an entry, even if the server sent
    /// no samples for it.
    pub fn prepare_data(&mut self, keys: &[String]) {
        for key in keys {
            self.data.entry(key.clone()).or_default();
        }
    }

    /// Merge the first sample of each key into `orig`, updating existing
    /// keys in place and appending new ones.
    pub fn update_attribute_data(&self, orig: &mut Vec<AttributeData>) {
        for (key, samples) in &self.data {
            let Some((ts, value)) = samples.first() else {
                continue;
            };
            match orig.iter_mut().find(|a| &a.key == key) {
                Some(existing) => {
                    existing.last_update_ts = *ts;
                    existing.value = value.clone();
                }
                None => orig.push(AttributeData {
                    key: key.clone(),
                    last_update_ts: *ts,
                    value: value.clone(),
                }),
            }
        }
    }
}
