//! # CDC I/O - Source Producers and Sink Adapters
//!
//! This crate provides the concrete implementations of the `Producer` and
//! `Sink` traits defined in `cdc-core`: connectors for relational binlogs,
//! MongoDB-style change streams, Kafka (both as a producer source and as a
//! log-topic sink), cloud change-feed polling, search indexes, document
//! stores, and relational targets.
//!
//! ## Sources
//! - **Binlog** ([`source_binlog`]): relational row-level change producer.
//! - **Change stream** ([`source_changestream`]): MongoDB-style document
//!   change producer.
//! - **Kafka** ([`source_kafka`]): consumes a pre-populated change topic.
//! - **Change feed** ([`source_changefeed`]): cloud change-feed polling via
//!   `reqwest`.
//!
//! ## Sinks
//! - **Kafka** ([`sink_kafka`]): re-publishes events to a log topic.
//! - **Search index** ([`sink_search`]): upserts into a search engine's
//!   HTTP API.
//! - **Document store** ([`sink_document`]): MongoDB-style upsert/delete.
//! - **Relational** ([`sink_relational`]): insert-only SQL sink.
//! - **Stdout** ([`sink_stdout`]): development and debugging output.
//!
//! ## Position stores
//! - **Mongo** ([`position_mongo`]): document-backed cursor storage, an
//!   alternative to `cdc-core`'s file-backed store.

pub mod position_mongo;
pub mod sink_document;
pub mod sink_kafka;
pub mod sink_relational;
pub mod sink_search;
pub mod sink_stdout;
pub mod source_binlog;
pub mod source_changefeed;
pub mod source_changestream;
pub mod source_kafka;

/// Recursively coerces MongoDB Extended JSON forms (`$oid`, `$numberInt`,
/// `$numberLong`, `$numberDouble`, `$date`) into native JSON types. Shared
/// by the change-stream producer and the document-store sink, both of
/// which exchange documents with a MongoDB-shaped wire format.
pub fn coerce_extended_json(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    match value {
        Value::Object(mut map) if map.len() == 1 => {
            if let Some(oid) = map.remove("$oid") {
                return oid;
            }
            if let Some(n) = map.remove("$numberInt") {
                return n
                    .as_str()
                    .and_then(|s| s.parse::<i64>().ok())
                    .map(Value::from)
                    .unwrap_or(Value::Null);
            }
            if let Some(n) = map.remove("$numberLong") {
                return n
                    .as_str()
                    .and_then(|s| s.parse::<i64>().ok())
                    .map(Value::from)
                    .unwrap_or(Value::Null);
            }
            if let Some(n) = map.remove("$numberDouble") {
                return n
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .map(Value::from)
                    .unwrap_or(Value::Null);
            }
            if let Some(date) = map.remove("$date") {
                return date;
            }
            Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, coerce_extended_json(v)))
                    .collect(),
            )
        }
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, coerce_extended_json(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(coerce_extended_json).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerces_oid_and_numeric_forms() {
        let input = json!({
            "_id": {"$oid": "507f1f77bcf86cd799439011"},
            "amount": {"$numberLong": "42"},
            "price": {"$numberDouble": "19.99"},
            "nested": {"count": {"$numberInt": "3"}}
        });
        let output = coerce_extended_json(input);
        assert_eq!(output["_id"], json!("507f1f77bcf86cd799439011"));
        assert_eq!(output["amount"], json!(42));
        assert_eq!(output["price"], json!(19.99));
        assert_eq!(output["nested"]["count"], json!(3));
    }
}
