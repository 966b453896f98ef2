//! The declarative transformation rule model. Evaluation lives in the
//! `cdc-tx` crate; this module only carries the shape so it can be parsed
//! straight out of pipeline configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    Contains,
    Exists,
    In,
    NotIn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Dotted path into the event's decoded `data`, e.g. `"address.city"`.
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub type_hint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: String,
    pub spec: serde_json::Value,
    #[serde(default)]
    pub target_field: Option<String>,
    #[serde(default)]
    pub config: std::collections::HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    FailFast,
    Skip,
    Retry,
    DeadLetter,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPolicy {
    pub strategy: ErrorStrategy,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay", with = "humantime_serde_compat")]
    pub retry_delay: Duration,
    #[serde(default)]
    pub dead_letter_topic: Option<String>,
    #[serde(default = "default_true")]
    pub log_errors: bool,
    #[serde(default = "default_true")]
    pub metrics: bool,
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_true() -> bool {
    true
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            strategy: ErrorStrategy::Skip,
            max_retries: 0,
            retry_delay: default_retry_delay(),
            dead_letter_topic: None,
            log_errors: true,
            metrics: true,
        }
    }
}

/// A named, priority-ordered, condition-gated set of actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

/// `Duration` doesn't implement `Deserialize` as a plain "200ms" string
/// without an adapter; a millisecond integer is simplest to round-trip
/// through YAML/JSON config without an extra dependency.
mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
