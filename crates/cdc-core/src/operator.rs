//! The `Producer` and `Sink` seams implemented by the `cdc-io` crate, plus
//! the bounded channel type aliases that connect them to the orchestrator.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::event::Event;

/// Sender half of the pipeline's bounded event channel. Single writer per
/// producer.
pub type EventTx = mpsc::Sender<Event>;
/// Receiver half of the pipeline's bounded event channel. Single reader:
/// the dispatcher.
pub type EventRx = mpsc::Receiver<Event>;

/// Default bounded-channel capacity between a producer and the dispatcher.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Stopped,
    Running,
    Paused,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct ProducerMetrics {
    pub events_emitted: u64,
    pub events_filtered: u64,
    pub errors: u64,
    pub last_event_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ProducerStatus {
    pub state: ProducerState,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Default for ProducerStatus {
    fn default() -> Self {
        Self {
            state: ProducerState::Stopped,
            last_error: None,
            started_at: None,
            stopped_at: None,
        }
    }
}

/// A source that translates a vendor-specific change protocol into
/// [`Event`]s and enqueues them on the pipeline's bounded channel.
///
/// State machine: `Stopped` -(start)-> `Running` -(pause)-> `Paused`
/// -(resume)-> `Running` -(stop)-> `Stopped`; any state can transition to
/// `Error` on an unrecoverable failure.
#[async_trait]
pub trait Producer: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&mut self, tx: EventTx, cancel: CancellationToken) -> anyhow::Result<()>;

    async fn stop(&mut self, cancel: CancellationToken) -> anyhow::Result<()>;

    async fn pause(&mut self) -> anyhow::Result<()>;

    async fn resume(&mut self) -> anyhow::Result<()>;

    fn state(&self) -> ProducerState;

    fn metrics(&self) -> ProducerMetrics;

    /// Overrides the in-memory cursor, e.g. after loading it from the
    /// position store at startup.
    fn set_checkpoint(&mut self, position: Vec<u8>);

    /// The producer's current cursor, serialized. `None` before the first
    /// event has been observed.
    fn checkpoint(&self) -> Option<Vec<u8>>;
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("write error: {0}")]
    Write(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("operation unsupported by this sink: {0}")]
    Unsupported(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A target that consumes [`Event`]s with at-least-once delivery semantics.
/// Each sink owns its own connection pool, retry policy, and batching
/// policy; it MUST be safe to call from one dispatcher task at a time.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn write_event(&self, event: &Event) -> Result<(), SinkError>;

    async fn health_check(&self) -> Result<(), SinkError>;

    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Exponential backoff used by producers on transient error, capped at
/// `max_backoff` and bounded by `max_retries` before a producer declares a
/// failure fatal.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max_backoff: Duration,
    pub factor: f64,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            factor: 2.0,
            max_retries: 10,
        }
    }
}

impl BackoffPolicy {
    /// The delay to apply before retry attempt `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_max() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            factor: 2.0,
            max_retries: 10,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(10), Duration::from_secs(1));
    }
}
