//! The neutral record shape that flows from producers, through the
//! transformation engine, to sinks.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The kind of mutation an [`Event`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Insert,
    Update,
    Delete,
}

/// Errors raised by [`Event::validate`].
#[derive(Debug, Error)]
pub enum EventError {
    #[error("insert event must carry non-empty `data`")]
    MissingData,
    #[error("{0:?} event must carry non-empty `old_data`")]
    MissingOldData(Action),
    #[error("`old_data` is not a JSON object with at least one field: {0}")]
    InvalidOldData(serde_json::Error),
}

/// A single row/document mutation, translated from a vendor-specific change
/// protocol into a neutral shape.
///
/// Producers MUST NOT pretty-print or reorder fields of `data`/`old_data`
/// they did not themselves mutate — both are carried as raw bytes rather
/// than a parsed `serde_json::Value` so the original byte layout survives
/// from producer to transform entry untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub action: Action,
    pub schema: String,
    pub collection: String,
    /// Post-image payload. Empty for pure deletes.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Pre-image or document-key payload. Empty for inserts.
    #[serde(rename = "oldData", with = "base64_bytes")]
    pub old_data: Vec<u8>,
}

impl Event {
    pub fn new(
        action: Action,
        schema: impl Into<String>,
        collection: impl Into<String>,
        data: Vec<u8>,
        old_data: Vec<u8>,
    ) -> Self {
        Self {
            action,
            schema: schema.into(),
            collection: collection.into(),
            data,
            old_data,
        }
    }

    pub fn insert(schema: impl Into<String>, collection: impl Into<String>, data: Vec<u8>) -> Self {
        Self::new(Action::Insert, schema, collection, data, Vec::new())
    }

    pub fn update(
        schema: impl Into<String>,
        collection: impl Into<String>,
        data: Vec<u8>,
        old_data: Vec<u8>,
    ) -> Self {
        Self::new(Action::Update, schema, collection, data, old_data)
    }

    pub fn delete(schema: impl Into<String>, collection: impl Into<String>, old_data: Vec<u8>) -> Self {
        Self::new(Action::Delete, schema, collection, Vec::new(), old_data)
    }

    /// Validate the invariants from the data model: `insert` carries
    /// `data`; `update`/`delete` carry an `old_data` that decodes to a
    /// JSON object with at least one field.
    pub fn validate(&self) -> Result<(), EventError> {
        match self.action {
            Action::Insert => {
                if self.data.is_empty() {
                    return Err(EventError::MissingData);
                }
            }
            Action::Update | Action::Delete => {
                if self.old_data.is_empty() {
                    return Err(EventError::MissingOldData(self.action));
                }
                let value: serde_json::Value =
                    serde_json::from_slice(&self.old_data).map_err(EventError::InvalidOldData)?;
                let has_field = value.as_object().map(|m| !m.is_empty()).unwrap_or(false);
                if !has_field {
                    return Err(EventError::InvalidOldData(
                        serde::de::Error::custom("old_data is not a non-empty JSON object"),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Serializes `Vec<u8>` as base64 so raw, possibly non-UTF8 payloads survive
/// round-tripping through JSON (used when an `Event` itself is serialized,
/// e.g. by the log-topic sink).
mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_requires_data() {
        let event = Event::insert("test", "canal_test", Vec::new());
        assert!(matches!(event.validate(), Err(EventError::MissingData)));
    }

    #[test]
    fn insert_with_data_is_valid() {
        let event = Event::insert("test", "canal_test", br#"{"id":6,"output":"hello world"}"#.to_vec());
        assert!(event.validate().is_ok());
    }

    #[test]
    fn update_requires_non_empty_old_data_object() {
        let event = Event::update("test", "canal_test", br#"{"id":6}"#.to_vec(), b"{}".to_vec());
        assert!(event.validate().is_err());
    }

    #[test]
    fn delete_with_identifier_is_valid() {
        let event = Event::delete("test", "canal_test", br#"{"id":6}"#.to_vec());
        assert!(event.validate().is_ok());
    }

    #[test]
    fn event_round_trips_through_json_byte_exact() {
        let event = Event::insert("test", "canal_test", br#"{"b":1,"a":2}"#.to_vec());
        let encoded = serde_json::to_vec(&event).unwrap();
        let decoded: Event = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.data, event.data);
    }
}
