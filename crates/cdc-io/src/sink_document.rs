//! Document-store sink: mirrors events into a MongoDB collection. MongoDB
//! Extended JSON forms in the decoded payload are coerced to native BSON
//! types before being sent (see [`crate::coerce_extended_json`]).

use async_trait::async_trait;
use cdc_core::{Action, Event, Sink, SinkError};
use mongodb::bson::{self, Document};
use mongodb::{Client, Collection};
use serde_json::Value;

use crate::coerce_extended_json;

pub struct DocumentStoreSink {
    id: String,
    collection: Collection<Document>,
}

impl DocumentStoreSink {
    pub async fn connect(
        id: impl Into<String>,
        uri: &str,
        database: &str,
        collection: &str,
    ) -> Result<Self, SinkError> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| SinkError::Connection(e.to_string()))?;
        let collection = client.database(database).collection(collection);
        Ok(Self { id: id.into(), collection })
    }

    fn decode_document(bytes: &[u8]) -> Result<Document, SinkError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let coerced = coerce_extended_json(value);
        bson::to_document(&coerced).map_err(|e| SinkError::Write(e.to_string()))
    }
}

#[async_trait]
impl Sink for DocumentStoreSink {
    fn name(&self) -> &str {
        &self.id
    }

    async fn write_event(&self, event: &Event) -> Result<(), SinkError> {
        match event.action {
            Action::Insert => {
                let document = Self::decode_document(&event.data)?;
                self.collection
                    .insert_one(document, None)
                    .await
                    .map_err(|e| SinkError::Write(e.to_string()))?;
            }
            Action::Update => {
                if event.old_data.is_empty() {
                    return Err(SinkError::Write("update event missing document key in old_data".to_string()));
                }
                let filter = Self::decode_document(&event.old_data)?;
                let body = Self::decode_document(&event.data)?;
                let update = bson::doc! { "$set": body };
                let result = self
                    .collection
                    .update_one(filter, update, None)
                    .await
                    .map_err(|e| SinkError::Write(e.to_string()))?;
                if result.matched_count == 0 {
                    return Err(SinkError::NotFound("document targeted by update not found".to_string()));
                }
            }
            Action::Delete => {
                if event.old_data.is_empty() {
                    return Err(SinkError::Write("delete event missing document key in old_data".to_string()));
                }
                let filter = Self::decode_document(&event.old_data)?;
                self.collection
                    .delete_many(filter, None)
                    .await
                    .map_err(|e| SinkError::Write(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        self.collection
            .estimated_document_count(None)
            .await
            .map(|_| ())
            .map_err(|e| SinkError::Connection(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_document_coerces_extended_json() {
        let bytes = br#"{"_id":{"$oid":"507f1f77bcf86cd799439011"},"count":{"$numberLong":"42"}}"#;
        let document = DocumentStoreSink::decode_document(bytes).unwrap();
        assert!(document.get_object_id("_id").is_ok());
        assert_eq!(document.get_i64("count").unwrap(), 42);
    }
}
