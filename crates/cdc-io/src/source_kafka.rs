//! Kafka producer: joins a consumer group, subscribes to a change topic,
//! and decodes each message value. A payload that is already a
//! JSON-encoded `Event` (e.g. published upstream by another replicator
//! instance's [`crate::sink_kafka::KafkaSink`]) is forwarded as-is;
//! otherwise the raw bytes become `data` with `action` defaulting to
//! `insert`. Offsets are committed manually, after the event has been
//! successfully enqueued on the pipeline channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cdc_core::{Action, Event, EventTx, Producer, ProducerMetrics, ProducerState};
use chrono::Utc;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::ClientConfig;
use rdkafka::Message as _;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct KafkaProducer {
    id: String,
    brokers: String,
    group_id: String,
    topic: String,
    state: Arc<RwLock<ProducerState>>,
    metrics: Arc<RwLock<ProducerMetrics>>,
    checkpoint: Arc<RwLock<Option<Vec<u8>>>>,
    paused: Arc<AtomicBool>,
}

impl KafkaProducer {
    pub fn new(id: impl Into<String>, brokers: impl Into<String>, group_id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            brokers: brokers.into(),
            group_id: group_id.into(),
            topic: topic.into(),
            state: Arc::new(RwLock::new(ProducerState::Stopped)),
            metrics: Arc::new(RwLock::new(ProducerMetrics::default())),
            checkpoint: Arc::new(RwLock::new(None)),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Producer for KafkaProducer {
    fn name(&self) -> &str {
        &self.id
    }

    async fn start(&mut self, tx: EventTx, cancel: CancellationToken) -> anyhow::Result<()> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .create()?;
        consumer.subscribe(&[&self.topic])?;
        let consumer = Arc::new(consumer);

        *self.state.write().await = ProducerState::Running;

        let state = self.state.clone();
        let metrics = self.metrics.clone();
        let checkpoint = self.checkpoint.clone();
        let paused = self.paused.clone();
        let name = self.id.clone();

        tokio::spawn(async move {
            let mut stream = consumer.stream();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(producer = %name, "kafka producer cancelled");
                        break;
                    }
                    next = stream.next() => {
                        let Some(result) = next else { break };
                        if paused.load(Ordering::Relaxed) {
                            continue;
                        }
                        match result {
                            Ok(message) => {
                                let Some(payload) = message.payload() else { continue };
                                let event = serde_json::from_slice::<Event>(payload).unwrap_or_else(|_| {
                                    Event::new(Action::Insert, "kafka", name.clone(), payload.to_vec(), Vec::new())
                                });

                                let position = format!(
                                    "{}:{}:{}",
                                    message.topic(),
                                    message.partition(),
                                    message.offset()
                                );

                                if tx.send(event).await.is_err() {
                                    break;
                                }
                                if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                                    warn!(producer = %name, error = %e, "failed to commit kafka offset");
                                }
                                *checkpoint.write().await = Some(position.into_bytes());
                                let mut m = metrics.write().await;
                                m.events_emitted += 1;
                                m.last_event_at = Some(Utc::now());
                            }
                            Err(e) => {
                                warn!(producer = %name, error = %e, "kafka consume error");
                                metrics.write().await.errors += 1;
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

    #[test]
    fn starts_in_stopped_state() {
        let producer = KafkaProducer::new("kafka-src", "localhost:9092", "cdc-group", "changes");
        assert_eq!(producer.state(), ProducerState::Stopped);
        assert!(producer.checkpoint().is_none());
    }
}
