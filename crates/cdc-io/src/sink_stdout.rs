use async_trait::async_trait;
use cdc_core::{Event, Sink, SinkError};

/// Development and debugging sink. Prints the raw event payload to stdout
/// rather than a pretty-printed re-encoding, preserving whatever byte
/// layout the producer emitted.
pub struct StdoutSink {
    id: String,
}

impl StdoutSink {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl Sink for StdoutSink {
    fn name(&self) -> &str {
        &self.id
    }

    async fn write_event(&self, event: &Event) -> Result<(), SinkError> {
        let payload = if event.data.is_empty() { &event.old_data } else { &event.data };
        println!(
            "{} {}.{} {}",
            serde_json::to_string(&event.action).unwrap_or_default(),
            event.schema,
            event.collection,
            String::from_utf8_lossy(payload)
        );
        Ok(())
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_insert_event_without_error() {
        let sink = StdoutSink::new("stdout".to_string());
        let event = Event::insert("shop", "orders", br#"{"id":1}"#.to_vec());
        assert!(sink.write_event(&event).await.is_ok());
    }
}
