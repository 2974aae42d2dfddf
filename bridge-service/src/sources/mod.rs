pub mod feed_relay;
pub mod tibber_history;

pub use feed_relay::{FeedRelayOptions, HttpFeedRelay};
pub use tibber_history::TibberHistoryClient;

use bridge_client::domain::{Reading, Value};

/// Flatten a JSON object into a [`Reading`].
///
/// Scalars map onto [`Value`]; nested arrays and objects are dropped.
pub fn reading_from_json(payload: serde_json::Map<String, serde_json::Value>) -> Reading {
    payload
        .into_iter()
        .filter_map(|(key, value)| {
            let value = match value {
                serde_json::Value::Null => Value::Null,
                serde_json::Value::Bool(b) => Value::Bool(b),
                serde_json::Value::Number(n) => Value::Number(n.as_f64()?),
                serde_json::Value::String(s) => Value::Text(s),
                serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                    tracing::debug!(key = %key, "dropping nested value from feed payload");
                    return None;
                }
            };
            Some((key, value))
        })
        .collect()
}
