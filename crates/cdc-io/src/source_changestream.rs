//! Document change-stream producer: watches a MongoDB collection (or an
//! entire database) via `mongodb::Collection::watch`, translating each
//! `ChangeStreamEvent` into an `Event`. Post-image lookup is enabled
//! (`full_document: FullDocument::UpdateLookup`) so updates carry a
//! complete post-image rather than a diff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cdc_core::{Action, Event, EventTx, Producer, ProducerMetrics, ProducerState};
use chrono::Utc;
use futures::StreamExt;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::options::{ChangeStreamOptions, FullDocumentType};
use mongodb::{bson::Document, Client, Collection};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct ChangeStreamProducer {
    id: String,
    uri: String,
    database: String,
    collection: Option<String>,
    state: Arc<RwLock<ProducerState>>,
    metrics: Arc<RwLock<ProducerMetrics>>,
    checkpoint: Arc<RwLock<Option<Vec<u8>>>>,
    paused: Arc<AtomicBool>,
}

impl ChangeStreamProducer {
    pub fn new(id: impl Into<String>, uri: impl Into<String>, database: impl Into<String>, collection: Option<String>) -> Self {
        Self {
            id: id.into(),
            uri: uri.into(),
            database: database.into(),
            collection,
            state: Arc::new(RwLock::new(ProducerState::Stopped)),
            metrics: Arc::new(RwLock::new(ProducerMetrics::default())),
            checkpoint: Arc::new(RwLock::new(None)),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }
}

fn change_event_to_event(database: &str, collection: &str, change: &ChangeStreamEvent<Document>) -> Option<Event> {
    let action = match change.operation_type {
        OperationType::Insert => Action::Insert,
        OperationType::Update | OperationType::Replace => Action::Update,
        OperationType::Delete => Action::Delete,
        _ => return None,
    };

    // `Event.data`/`old_data` is opaque *JSON*, not BSON: serializing a
    // `bson::Document` through `serde_json` (rather than `bson::to_vec`)
    // yields MongoDB's extended-JSON encoding for BSON-only types like
    // `ObjectId`/`DateTime` (`{"$oid": ...}`/`{"$date": ...}`), which
    // `coerce_extended_json` downstream is built to consume.
    let key_json = change
        .document_key
        .as_ref()
        .and_then(|doc| serde_json::to_vec(doc).ok())
        .unwrap_or_default();

    let data = match action {
        Action::Delete => Vec::new(),
        _ => change
            .full_document
            .as_ref()
            .and_then(|doc| serde_json::to_vec(doc).ok())
            .unwrap_or_default(),
    };

    Some(Event::new(action, database, collection, data, key_json))
}

#[async_trait]
impl Producer for ChangeStreamProducer {
    fn name(&self) -> &str {
        &self.id
    }

    async fn start(&mut self, tx: EventTx, cancel: CancellationToken) -> anyhow::Result<()> {
        let client = Client::with_uri_str(&self.uri).await?;
        let db = client.database(&self.database);

        let mut options = ChangeStreamOptions::default();
        options.full_document = Some(FullDocumentType::UpdateLookup);
        if let Some(token_bytes) = self.checkpoint.read().await.clone() {
            if let Ok(token) = bson::from_slice::<ResumeToken>(&token_bytes) {
                options.resume_after = Some(token);
            }
        }

        let mut stream = match &self.collection {
            Some(name) => {
                let coll: Collection<Document> = db.collection(name);
                coll.watch().with_options(options).await?
            }
            None => db.watch().with_options(options).await?,
        };

        *self.state.write().await = ProducerState::Running;

        let state = self.state.clone();
        let metrics = self.metrics.clone();
        let checkpoint = self.checkpoint.clone();
        let paused = self.paused.clone();
        let name = self.id.clone();
        let database = self.database.clone();
        let default_collection = self.collection.clone().unwrap_or_default();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(producer = %name, "change-stream producer cancelled");
                        break;
                    }
                    next = stream.next() => {
                        match next {
                            Some(Ok(change)) => {
                                if paused.load(Ordering::Relaxed) {
                                    continue;
                                }
                                let collection = change
                                    .ns
                                    .as_ref()
                                    .map(|ns| ns.coll.clone())
                                    .unwrap_or_else(|| default_collection.clone());

                                if let Some(event) = change_event_to_event(&database, &collection, &change) {
                                    if let Some(token) = &change.id.as_document() {
                                        if let Ok(bytes) = bson::to_vec(token) {
                                            *checkpoint.write().await = Some(bytes);
                                        }
                                    }
                                    if tx.send(event).await.is_err() {
                                        break;
                                    }
                                    let mut m = metrics.write().await;
                                    m.events_emitted += 1;
                                    m.last_event_at = Some(Utc::now());
                                } else {
                                    metrics.write().await.events_filtered += 1;
                                }
                            }
                            Some(Err(e)) => {
                                warn!(producer = %name, error = %e, "change stream error");
                                metrics.write().await.errors += 1;
                            }
                            None => {
                                // Cursor has no immediate data; avoid busy-waiting.
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                }
            }
            *state.write().await = ProducerState::Stopped;
        });

        Ok(())
    }

    async fn stop(&mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        cancel.cancel();
        *self.state.write().await = ProducerState::Stopped;
        Ok(())
    }

    async fn pause(&mut self) -> anyhow::Result<()> {
        self.paused.store(true, Ordering::Relaxed);
        *self.state.write().await = ProducerState::Paused;
        Ok(())
    }

    async fn resume(&mut self) -> anyhow::Result<()> {
        self.paused.store(false, Ordering::Relaxed);
        *self.state.write().await = ProducerState::Running;
        Ok(())
    }

    fn state(&self) -> ProducerState {
        self.state.try_read().map(|s| *s).unwrap_or(ProducerState::Error)
    }

    fn metrics(&self) -> ProducerMetrics {
        self.metrics.try_read().map(|m| m.clone()).unwrap_or_default()
    }

    fn set_checkpoint(&mut self, position: Vec<u8>) {
        if let Ok(mut guard) = self.checkpoint.try_write() {
            *guard = Some(position);
        }
    }

    fn checkpoint(&self) -> Option<Vec<u8>> {
        self.checkpoint.try_read().ok().and_then(|g| g.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[test]
    fn insert_event_carries_full_document_and_key() {
        let change: ChangeStreamEvent<Document> = ChangeStreamEvent {
            id: bson::Bson::Document(doc! {"_data": "token"}),
            operation_type: OperationType::Insert,
            ns: None,
            document_key: Some(doc! {"_id": 1}),
            full_document: Some(doc! {"_id": 1, "name": "Alice"}),
            ..Default::default()
        };
        let event = change_event_to_event("shop", "customers", &change).unwrap();
        assert_eq!(event.action, Action::Insert);
        assert!(!event.data.is_empty());
        assert!(!event.old_data.is_empty());
        assert!(serde_json::from_slice::<serde_json::Value>(&event.data).is_ok());
        assert!(serde_json::from_slice::<serde_json::Value>(&event.old_data).is_ok());
    }
}
