//! Search-index sink: auto-creates a single-shard, zero-replica, dynamic-
//! mapping index on first use, then mirrors each event as an index/update/
//! delete request against the index's HTTP API.

use async_trait::async_trait;
use cdc_core::{Action, Event, Sink, SinkError};
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::debug;

pub struct SearchIndexSink {
    id: String,
    base_url: String,
    index: String,
    client: reqwest::Client,
    refresh: bool,
    index_ready: OnceCell<()>,
}

impl SearchIndexSink {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, index: impl Into<String>, refresh: bool) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            index: index.into(),
            client: reqwest::Client::new(),
            refresh,
            index_ready: OnceCell::new(),
        }
    }

    async fn ensure_index(&self) -> Result<(), SinkError> {
        self.index_ready
            .get_or_try_init(|| async {
                let url = format!("{}/{}", self.base_url, self.index);
                let head = self
                    .client
                    .head(&url)
                    .send()
                    .await
                    .map_err(|e| SinkError::Connection(e.to_string()))?;
                if head.status().is_success() {
                    return Ok(());
                }
                let body = json!({
                    "settings": {"number_of_shards": 1, "number_of_replicas": 0},
                    "mappings": {"dynamic": true},
                });
                self.client
                    .put(&url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| SinkError::Connection(e.to_string()))?
                    .error_for_status()
                    .map_err(|e| SinkError::Write(e.to_string()))?;
                Ok(())
            })
            .await
            .map(|_| ())
    }

    fn document_id(event: &Event) -> Result<String, SinkError> {
        let source = if event.action == Action::Delete || !event.old_data.is_empty() {
            &event.old_data
        } else {
            &event.data
        };
        let value: Value = serde_json::from_slice(source)?;
        match &value {
            Value::Object(map) => map
                .get("id")
                .or_else(|| map.values().next())
                .map(stringify_id)
                .ok_or_else(|| SinkError::Write("document carries no identifiable field".to_string())),
            Value::Array(items) => items
                .first()
                .map(stringify_id)
                .ok_or_else(|| SinkError::Write("row array is empty".to_string())),
            other => Ok(stringify_id(other)),
        }
    }
}

fn stringify_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Sink for SearchIndexSink {
    fn name(&self) -> &str {
        &self.id
    }

    async fn write_event(&self, event: &Event) -> Result<(), SinkError> {
        self.ensure_index().await?;
        let id = Self::document_id(event)?;
        let url = format!("{}/{}/_doc/{}", self.base_url, self.index, id);

        let request = match event.action {
            Action::Insert => {
                let body: Value = serde_json::from_slice(&event.data)?;
                self.client.put(&url).query(&[("refresh", self.refresh)]).json(&body)
            }
            Action::Update => {
                let body: Value = serde_json::from_slice(&event.data)?;
                let update_url = format!("{}/{}/_update/{}", self.base_url, self.index, id);
                let payload = json!({"doc": body, "doc_as_upsert": true});
                self.client
                    .post(&update_url)
                    .query(&[("refresh", self.refresh)])
                    .json(&payload)
            }
            Action::Delete => self.client.delete(&url).query(&[("refresh", self.refresh)]),
        };

        let response = request.send().await.map_err(|e| SinkError::Write(e.to_string()))?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(SinkError::Write(format!("search index returned {}", response.status())));
        }
        debug!(sink = %self.id, index = %self.index, document_id = %id, action = ?event.action, "indexed event");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        self.client
            .get(&self.base_url)
            .send()
            .await
            .map_err(|e| SinkError::Connection(e.to_string()))?
            .error_for_status()
            .map(|_| ())
            .map_err(|e| SinkError::Connection(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_from_row_insert_uses_id_field() {
        let event = Event::insert("test", "canal_test", br#"{"id":6,"output":"hello world"}"#.to_vec());
        assert_eq!(SearchIndexSink::document_id(&event).unwrap(), "6");
    }

    #[test]
    fn document_id_from_delete_uses_old_data_key() {
        let event = Event::delete("test", "canal_test", br#"{"id":6}"#.to_vec());
        assert_eq!(SearchIndexSink::document_id(&event).unwrap(), "6");
    }

    #[test]
    fn document_id_falls_back_to_first_field_when_no_id() {
        let event = Event::insert("test", "canal_test", br#"{"sku":"ABC-1"}"#.to_vec());
        assert_eq!(SearchIndexSink::document_id(&event).unwrap(), "ABC-1");
    }
}
