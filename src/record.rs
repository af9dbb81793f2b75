//! Record module holding the unit of data the forwarder ships.
//!
//! A [`Record`] is one already-normalized log entry: a JSON object with unique
//! string keys. The delivery engine never mutates records; the remapping
//! helpers here run on the host side before a record is handed over.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Jan 24th 2065 in seconds (Feb 4th 1970 if read as milliseconds).
const MAX_SECONDS: i64 = 3_000_000_000;

/// Jan 24th 2065 in milliseconds.
const MAX_MILLISECONDS: i64 = MAX_SECONDS * 1000;

/// Jan 24th 2065 in microseconds.
const MAX_MICROSECONDS: i64 = MAX_MILLISECONDS * 1000;

/// Source reported in the `plugin` attribute when `SOURCE` is unset.
const DEFAULT_SOURCE: &str = "BARE-METAL";

/// A single structured log entry.
///
/// Serializes as a plain JSON object, so a batch of records serializes as a
/// JSON array of objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Create an empty record.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a record from a JSON value. Returns `None` unless the value is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Builder-style field insertion, mostly useful for tests and hosts.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the underlying JSON object.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Apply the host-side field remapping.
    ///
    /// - `log` becomes `message`, unless `message` is already present
    /// - an integer `timestamp` is normalized to milliseconds
    /// - a `plugin` object is attached when the record has none
    pub fn remap(mut self, plugin_version: &str, source: Option<&str>) -> Self {
        if !self.0.contains_key("message") {
            if let Some(log) = self.0.remove("log") {
                self.0.insert("message".to_string(), log);
            }
        }

        if let Some(ts) = self.0.get("timestamp").and_then(Value::as_i64) {
            self.0
                .insert("timestamp".to_string(), Value::from(timestamp_to_millis(ts)));
        }

        if !self.0.contains_key("plugin") {
            let mut plugin = Map::new();
            plugin.insert("type".to_string(), Value::from("log-forwarder"));
            plugin.insert("version".to_string(), Value::from(plugin_version));
            plugin.insert(
                "source".to_string(),
                Value::from(source.unwrap_or(DEFAULT_SOURCE)),
            );
            self.0.insert("plugin".to_string(), Value::Object(plugin));
        }

        self
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Convert an integer timestamp of unknown unit into milliseconds.
///
/// The unit is inferred by magnitude, checked in this order: seconds,
/// milliseconds, microseconds, otherwise nanoseconds. The heuristic stops
/// working for second-scale timestamps past Jan 24th 2065.
pub fn timestamp_to_millis(ts: i64) -> i64 {
    if ts < MAX_SECONDS {
        ts.saturating_mul(1000)
    } else if ts < MAX_MILLISECONDS {
        ts
    } else if ts < MAX_MICROSECONDS {
        ts / 1000
    } else {
        ts / 1_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_requires_object() {
        assert!(Record::from_value(json!({"a": 1})).is_some());
        assert!(Record::from_value(json!([1, 2])).is_none());
        assert!(Record::from_value(json!("text")).is_none());
        assert!(Record::from_value(Value::Null).is_none());
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let record = Record::new().with("message", "hello").with("level", 3);
        let encoded = serde_json::to_value(&record).unwrap();
        assert_eq!(encoded, json!({"message": "hello", "level": 3}));

        let batch = vec![Record::new(), Record::new()];
        assert_eq!(serde_json::to_string(&batch).unwrap(), "[{},{}]");
    }

    #[test]
    fn test_remap_renames_log_field() {
        let record = Record::new().with("log", "some line").remap("1.0.0", None);
        assert_eq!(record.get("message"), Some(&json!("some line")));
        assert!(record.get("log").is_none());
    }

    #[test]
    fn test_remap_keeps_existing_message() {
        let record = Record::new()
            .with("log", "raw")
            .with("message", "parsed")
            .remap("1.0.0", None);
        assert_eq!(record.get("message"), Some(&json!("parsed")));
        assert_eq!(record.get("log"), Some(&json!("raw")));
    }

    #[test]
    fn test_remap_adds_plugin_attributes() {
        let record = Record::new().remap("2.3.4", None);
        assert_eq!(
            record.get("plugin"),
            Some(&json!({"type": "log-forwarder", "version": "2.3.4", "source": "BARE-METAL"}))
        );

        let record = Record::new().remap("2.3.4", Some("docker"));
        assert_eq!(record.get("plugin").unwrap()["source"], json!("docker"));
    }

    #[test]
    fn test_remap_does_not_overwrite_plugin() {
        let record = Record::new()
            .with("plugin", json!({"type": "something"}))
            .remap("1.0.0", None);
        assert_eq!(record.get("plugin"), Some(&json!({"type": "something"})));
    }

    #[test]
    fn test_remap_normalizes_timestamp() {
        let record = Record::new()
            .with("timestamp", 1_600_000_000_i64)
            .remap("1.0.0", None);
        assert_eq!(record.get("timestamp"), Some(&json!(1_600_000_000_000_i64)));
    }

    #[test]
    fn test_timestamp_units() {
        let millis = 1_600_000_000_123_i64;
        assert_eq!(timestamp_to_millis(1_600_000_000), 1_600_000_000_000);
        assert_eq!(timestamp_to_millis(millis), millis);
        assert_eq!(timestamp_to_millis(millis * 1000), millis);
        assert_eq!(timestamp_to_millis(millis * 1_000_000), millis);
    }
}
