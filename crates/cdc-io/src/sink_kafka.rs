//! Log-topic sink: re-serializes the full `Event` as JSON and publishes it
//! to a configured Kafka topic with `acks=all` and bounded producer
//! retries.

use async_trait::async_trait;
use cdc_core::{Event, Sink, SinkError};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::debug;

pub struct KafkaSink {
    id: String,
    topic: String,
    producer: FutureProducer,
}

impl KafkaSink {
    pub fn new(id: impl Into<String>, brokers: &str, topic: impl Into<String>) -> Result<Self, SinkError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "30000")
            .set("acks", "all")
            .set("message.send.max.retries", "10")
            .create()
            .map_err(|e| SinkError::Connection(e.to_string()))?;
        Ok(Self { id: id.into(), topic: topic.into(), producer })
    }
}

#[async_trait]
impl Sink for KafkaSink {
    fn name(&self) -> &str {
        &self.id
    }

    async fn write_event(&self, event: &Event) -> Result<(), SinkError> {
        let payload = serde_json::to_vec(event)?;
        let key = format!("{}.{}", event.schema, event.collection);
        let record = FutureRecord::to(&self.topic).payload(&payload).key(&key);
        match self.producer.send(record, Duration::from_secs(0)).await {
            Ok((partition, offset)) => {
                debug!(sink = %self.id, topic = %self.topic, partition, offset, "published event");
                Ok(())
            }
            Err((e, _)) => Err(SinkError::Write(e.to_string())),
        }
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        self.producer
            .client()
            .fetch_metadata(Some(&self.topic), Duration::from_secs(5))
            .map(|_| ())
            .map_err(|e| SinkError::Connection(e.to_string()))
    }
}
