//! Events routed between nodes.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Milliseconds since the Unix epoch.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// A unit of work entering the cluster from a source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Name of the source that produced the event.
    #[serde(default)]
    pub source_name: String,
    /// Type of the payload.
    #[serde(default)]
    pub data_type: String,
    /// Affinity key; events with the same tag land on the same node.
    #[serde(default)]
    pub hash_tag: Option<String>,
    /// Event body.
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Creation time in milliseconds since the Unix epoch.
    #[serde(default = "now_millis")]
    pub timestamp: u64,
    /// Free-form metadata.
    #[serde(default)]
    pub attachments: HashMap<String, Value>,
}

impl Event {
    /// New event stamped with the current time.
    #[must_use]
    pub fn new(source_name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            data_type: data_type.into(),
            hash_tag: None,
            payload: Map::new(),
            timestamp: now_millis(),
            attachments: HashMap::new(),
        }
    }

    /// Set the affinity key.
    #[must_use]
    pub fn with_hash_tag(mut self, tag: impl Into<String>) -> Self {
        self.hash_tag = Some(tag.into());
        self
    }

    /// Set one payload field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Set one attachment.
    #[must_use]
    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    /// Key used for affinity routing: the hash tag, or the data type when
    /// there is no tag. `None` when both are empty.
    #[must_use]
    pub fn routing_key(&self) -> Option<&str> {
        self.hash_tag
            .as_deref()
            .filter(|tag| !tag.is_empty())
            .or_else(|| Some(self.data_type.as_str()).filter(|data_type| !data_type.is_empty()))
    }

    /// JSON encoding carried in RPC payloads.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be serialized.
    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::InvalidEvent(e.to_string()))
    }

    /// Parse the JSON encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is not a JSON event.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::InvalidEvent(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_routing_key_prefers_hash_tag() {
        let event = Event::new("src", "order").with_hash_tag("user-42");
        assert_eq!(event.routing_key(), Some("user-42"));
    }

    #[test]
    fn test_routing_key_falls_back_to_data_type() {
        assert_eq!(Event::new("src", "order").routing_key(), Some("order"));
        assert_eq!(
            Event::new("src", "order").with_hash_tag("").routing_key(),
            Some("order")
        );
    }

    #[test]
    fn test_no_routing_key() {
        assert_eq!(Event::new("src", "").routing_key(), None);
    }

    #[test]
    fn test_json_shape() {
        let event = Event::new("orders", "order")
            .with_hash_tag("u1")
            .with_field("amount", 12)
            .with_attachment("trace", "abc");

        let decoded = Event::from_bytes(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.payload["amount"], json!(12));
    }

    #[test]
    fn test_minimal_json_is_accepted() {
        let event = Event::from_bytes(br#"{"data_type":"click"}"#).unwrap();
        assert_eq!(event.data_type, "click");
        assert!(event.timestamp > 0);
        assert!(event.hash_tag.is_none());
    }
}
