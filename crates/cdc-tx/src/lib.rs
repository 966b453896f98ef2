//! # CDC Transformations - Declarative Rule Engine
//!
//! This crate applies a deterministic, priority-ordered sequence of rules to
//! each event's `data` payload before it reaches a sink. A rule is a set of
//! AND-combined conditions gating a list of actions; actions are compiled
//! once (see [`spec::CompiledSpec`]) from a JSON rewrite spec in the
//! `shift`/`concat`/`coalesce`/`default`/`delete` family and cached by their
//! canonical JSON string.
//!
//! ## Example Usage
//!
//! ```rust
//! use cdc_tx::TransformEngine;
//! use cdc_core::Event;
//!
//! # async fn run() {
//! let engine = TransformEngine::new();
//! let event = Event::insert("shop", "orders", br#"{"id":1}"#.to_vec());
//! let result = engine.transform(event).await;
//! assert!(result.success);
//! # }
//! ```

pub mod condition;
pub mod spec;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use cdc_core::{CdcError, ErrorStrategy, Event, Rule};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{error, warn};

use spec::SpecCache;

/// Outcome of running the ruleset against a single event.
#[derive(Debug, Clone)]
pub struct TransformResult {
    pub event: Event,
    pub success: bool,
    pub errors: Vec<String>,
    pub applied_rules: Vec<String>,
    pub skipped_rules: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct RuleCounters {
    executions: u64,
    failures: u64,
}

/// Aggregate engine statistics, also mirrored into the process-wide
/// `metrics` registry so the Prometheus exporter can surface them.
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub avg_latency: Duration,
    pub min_latency: Duration,
    pub max_latency: Duration,
    pub per_rule: Vec<(String, u64, u64)>,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct RawCounters {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    latency_sum_nanos: AtomicU64,
    min_latency_nanos: AtomicU64,
    max_latency_nanos: AtomicU64,
}

/// Applies a shared, dynamically editable ruleset to events flowing through
/// the pipeline. Safe to share across the dispatcher's concurrent sink
/// fan-out via `Arc<TransformEngine>` — the ruleset is guarded by an
/// `RwLock` snapshot-read on the hot path, mutated only by `add_rule`/
/// `remove_rule`.
pub struct TransformEngine {
    rules: RwLock<Vec<Rule>>,
    cache: SpecCache,
    counters: RawCounters,
    rule_counters: RwLock<std::collections::HashMap<String, RuleCounters>>,
    last_run_at: RwLock<Option<DateTime<Utc>>>,
}

impl Default for TransformEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformEngine {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            cache: SpecCache::new(),
            counters: RawCounters::default(),
            rule_counters: RwLock::new(std::collections::HashMap::new()),
            last_run_at: RwLock::new(None),
        }
    }

    /// Builds an engine from a ruleset loaded up front, e.g. from pipeline
    /// configuration at startup. Rejects duplicate names and malformed
    /// action specs the same way `add_rule` does.
    pub fn with_rules(rules: Vec<Rule>) -> Result<Self, CdcError> {
        let mut seen = std::collections::HashSet::new();
        for rule in &rules {
            if !seen.insert(rule.name.clone()) {
                return Err(CdcError::Validation(format!("duplicate rule name {:?}", rule.name)));
            }
            validate_rule(rule)?;
        }
        Ok(Self {
            rules: RwLock::new(rules),
            cache: SpecCache::new(),
            counters: RawCounters::default(),
            rule_counters: RwLock::new(std::collections::HashMap::new()),
            last_run_at: RwLock::new(None),
        })
    }

    pub async fn add_rule(&self, rule: Rule) -> Result<(), CdcError> {
        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.name == rule.name) {
            return Err(CdcError::Validation(format!("duplicate rule name {:?}", rule.name)));
        }
        validate_rule(&rule)?;
        rules.push(rule);
        Ok(())
    }

    pub async fn remove_rule(&self, name: &str) -> Result<(), CdcError> {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|r| r.name != name);
        if rules.len() == before {
            return Err(CdcError::NotFound(format!("rule {name:?}")));
        }
        Ok(())
    }

    pub async fn rules(&self) -> Vec<Rule> {
        self.rules.read().await.clone()
    }

    pub async fn validate_rules(&self) -> Result<(), CdcError> {
        let rules = self.rules.read().await;
        let mut seen = std::collections::HashSet::new();
        for rule in rules.iter() {
            if !seen.insert(&rule.name) {
                return Err(CdcError::Validation(format!("duplicate rule name {:?}", rule.name)));
            }
            validate_rule(rule)?;
        }
        Ok(())
    }

    /// Runs the current ruleset, sorted ascending by priority with ties
    /// broken by insertion order (a stable sort), against one event.
    pub async fn transform(&self, mut input: Event) -> TransformResult {
        let started = Instant::now();
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let mut ordered = self.rules.read().await.clone();
        ordered.sort_by_key(|r| r.priority);

        let mut data: serde_json::Value = match serde_json::from_slice(&input.data) {
            Ok(value) => value,
            Err(_) if input.data.is_empty() => serde_json::json!({}),
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                return TransformResult {
                    event: input,
                    success: false,
                    errors: vec![format!("event data is not valid JSON: {e}")],
                    applied_rules: Vec::new(),
                    skipped_rules: Vec::new(),
                };
            }
        };

        let mut errors = Vec::new();
        let mut applied_rules = Vec::new();
        let mut skipped_rules = Vec::new();
        let mut overall_success = true;

        for rule in ordered.iter().filter(|r| r.enabled) {
            if !condition::matches_all(&rule.conditions, &data) {
                skipped_rules.push(rule.name.clone());
                continue;
            }

            match self.run_rule_actions(rule, data.clone()).await {
                Ok(next) => {
                    data = next;
                    applied_rules.push(rule.name.clone());
                    self.record_rule(&rule.name, true).await;
                }
                Err(failure) => {
                    self.record_rule(&rule.name, false).await;
                    errors.push(format!("rule {:?}: {}", rule.name, failure));
                    match rule.error_policy.strategy {
                        ErrorStrategy::FailFast => {
                            overall_success = false;
                            break;
                        }
                        ErrorStrategy::Continue => {
                            overall_success = false;
                        }
                        ErrorStrategy::Skip | ErrorStrategy::Retry | ErrorStrategy::DeadLetter => {}
                    }
                    if rule.error_policy.log_errors {
                        error!(rule = %rule.name, error = %failure, "transform rule failed");
                    }
                }
            }
        }

        input.data = match serde_json::to_vec(&data) {
            Ok(bytes) => bytes,
            Err(e) => {
                overall_success = false;
                errors.push(format!("failed to re-encode transformed payload: {e}"));
                input.data
            }
        };

        let elapsed = started.elapsed();
        self.record_latency(elapsed);
        *self.last_run_at.write().await = Some(Utc::now());
        if overall_success {
            self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        if !skipped_rules.is_empty() {
            self.counters.skipped.fetch_add(skipped_rules.len() as u64, Ordering::Relaxed);
        }

        metrics::histogram!("cdc_transform_latency_seconds").record(elapsed.as_secs_f64());
        metrics::counter!("cdc_transform_total").increment(1);
        if !overall_success {
            metrics::counter!("cdc_transform_errors_total").increment(1);
        }

        TransformResult {
            event: input,
            success: overall_success,
            errors,
            applied_rules,
            skipped_rules,
        }
    }

    pub async fn transform_batch(&self, inputs: Vec<Event>) -> Vec<TransformResult> {
        let mut results = Vec::with_capacity(inputs.len());
        for input in inputs {
            results.push(self.transform(input).await);
        }
        results
    }

    async fn run_rule_actions(
        &self,
        rule: &Rule,
        mut data: serde_json::Value,
    ) -> Result<serde_json::Value, CdcError> {
        for action in &rule.actions {
            data = self.run_action_with_policy(rule, action, data).await?;
        }
        Ok(data)
    }

    async fn run_action_with_policy(
        &self,
        rule: &Rule,
        action: &cdc_core::RuleAction,
        data: serde_json::Value,
    ) -> Result<serde_json::Value, CdcError> {
        let compiled = self
            .cache
            .get_or_compile(&action.action_type, &action.spec)
            .map_err(|e| CdcError::Transform(e.to_string()))?;

        let mut attempt = 0u32;
        loop {
            match compiled.apply(&data) {
                Ok(next) => return Ok(next),
                Err(e) => {
                    if rule.error_policy.strategy == ErrorStrategy::Retry && attempt < rule.error_policy.max_retries {
                        attempt += 1;
                        warn!(rule = %rule.name, attempt, "retrying transform action after failure");
                        tokio::time::sleep(rule.error_policy.retry_delay).await;
                        continue;
                    }
                    if rule.error_policy.strategy == ErrorStrategy::DeadLetter {
                        warn!(
                            rule = %rule.name,
                            topic = ?rule.error_policy.dead_letter_topic,
                            "routing event to dead-letter topic after transform failure"
                        );
                        return Ok(data);
                    }
                    if matches!(rule.error_policy.strategy, ErrorStrategy::Skip) {
                        return Ok(data);
                    }
                    return Err(CdcError::Transform(e.to_string()));
                }
            }
        }
    }

    async fn record_rule(&self, name: &str, success: bool) {
        let mut counters = self.rule_counters.write().await;
        let entry = counters.entry(name.to_string()).or_default();
        entry.executions += 1;
        if !success {
            entry.failures += 1;
        }
    }

    fn record_latency(&self, elapsed: Duration) {
        let nanos = elapsed.as_nanos() as u64;
        self.counters.latency_sum_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.counters
            .min_latency_nanos
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(if current == 0 { nanos } else { current.min(nanos) })
            })
            .ok();
        self.counters.max_latency_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    pub async fn metrics(&self) -> EngineMetrics {
        let total = self.counters.total.load(Ordering::Relaxed);
        let sum = self.counters.latency_sum_nanos.load(Ordering::Relaxed);
        let avg = if total > 0 { Duration::from_nanos(sum / total) } else { Duration::ZERO };
        let per_rule = self
            .rule_counters
            .read()
            .await
            .iter()
            .map(|(name, counters)| (name.clone(), counters.executions, counters.failures))
            .collect();

        EngineMetrics {
            total,
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            avg_latency: avg,
            min_latency: Duration::from_nanos(self.counters.min_latency_nanos.load(Ordering::Relaxed)),
            max_latency: Duration::from_nanos(self.counters.max_latency_nanos.load(Ordering::Relaxed)),
            per_rule,
            last_run_at: *self.last_run_at.read().await,
        }
    }

    pub async fn reset_metrics(&self) {
        self.counters.total.store(0, Ordering::Relaxed);
        self.counters.succeeded.store(0, Ordering::Relaxed);
        self.counters.failed.store(0, Ordering::Relaxed);
        self.counters.skipped.store(0, Ordering::Relaxed);
        self.counters.latency_sum_nanos.store(0, Ordering::Relaxed);
        self.counters.min_latency_nanos.store(0, Ordering::Relaxed);
        self.counters.max_latency_nanos.store(0, Ordering::Relaxed);
        self.rule_counters.write().await.clear();
        *self.last_run_at.write().await = None;
    }
}

fn validate_rule(rule: &Rule) -> Result<(), CdcError> {
    if rule.actions.is_empty() {
        return Err(CdcError::Validation(format!("rule {:?} has no actions", rule.name)));
    }
    for action in &rule.actions {
        spec::CompiledSpec::compile(&action.action_type, &action.spec)
            .map_err(|e| CdcError::Validation(format!("rule {:?}: {e}", rule.name)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdc_core::{Action as RuleAction, Condition, ConditionOperator, ErrorPolicy, Rule};
    use serde_json::json;

    fn shift_rule(name: &str, priority: i32) -> Rule {
        Rule {
            name: name.to_string(),
            enabled: true,
            priority,
            conditions: Vec::new(),
            actions: vec![RuleAction {
                action_type: "shift".to_string(),
                spec: json!({"output": "result"}),
                target_field: None,
                config: Default::default(),
            }],
            error_policy: ErrorPolicy::default(),
        }
    }

    #[tokio::test]
    async fn empty_ruleset_is_identity() {
        let engine = TransformEngine::new();
        let event = Event::insert("shop", "orders", br#"{"id":1}"#.to_vec());
        let result = engine.transform(event.clone()).await;
        assert!(result.success);
        let input: serde_json::Value = serde_json::from_slice(&event.data).unwrap();
        let output: serde_json::Value = serde_json::from_slice(&result.event.data).unwrap();
        assert_eq!(input, output);
    }

    #[tokio::test]
    async fn single_shift_rule_renames_field() {
        let engine = TransformEngine::new();
        engine.add_rule(shift_rule("rename-output", 0)).await.unwrap();
        let event = Event::insert("shop", "orders", br#"{"output":"hello"}"#.to_vec());
        let result = engine.transform(event).await;
        assert!(result.success);
        let output: serde_json::Value = serde_json::from_slice(&result.event.data).unwrap();
        assert_eq!(output["result"], json!("hello"));
        assert!(output.get("output").is_none());
        assert_eq!(result.applied_rules, vec!["rename-output"]);
    }

    #[tokio::test]
    async fn rules_run_in_priority_order() {
        let engine = TransformEngine::new();
        let mut second = shift_rule("second", 10);
        second.actions[0].spec = json!({"result": "final"});
        engine.add_rule(second).await.unwrap();
        engine.add_rule(shift_rule("first", 0)).await.unwrap();

        let event = Event::insert("shop", "orders", br#"{"output":"hello"}"#.to_vec());
        let result = engine.transform(event).await;
        assert_eq!(result.applied_rules, vec!["first", "second"]);
        let output: serde_json::Value = serde_json::from_slice(&result.event.data).unwrap();
        assert_eq!(output["final"], json!("hello"));
    }

    #[tokio::test]
    async fn unmatched_condition_skips_rule() {
        let engine = TransformEngine::new();
        let mut rule = shift_rule("conditional", 0);
        rule.conditions.push(Condition {
            field: "status".to_string(),
            operator: ConditionOperator::Eq,
            value: json!("active"),
            type_hint: None,
        });
        engine.add_rule(rule).await.unwrap();

        let event = Event::insert("shop", "orders", br#"{"status":"archived","output":"hi"}"#.to_vec());
        let result = engine.transform(event).await;
        assert_eq!(result.skipped_rules, vec!["conditional"]);
        assert!(result.applied_rules.is_empty());
    }

    #[tokio::test]
    async fn skip_policy_leaves_event_unchanged_on_failure() {
        let engine = TransformEngine::new();
        let mut rule = shift_rule("will-fail", 0);
        rule.actions[0].spec = json!({"missing_field": "target"});
        rule.error_policy.strategy = cdc_core::ErrorStrategy::Skip;
        engine.add_rule(rule).await.unwrap();

        let event = Event::insert("shop", "orders", br#"{"id":1}"#.to_vec());
        let result = engine.transform(event).await;
        assert!(result.success);
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn fail_fast_marks_result_unsuccessful() {
        let engine = TransformEngine::new();
        let mut rule = shift_rule("will-fail", 0);
        rule.actions[0].spec = json!({"missing_field": "target"});
        rule.error_policy.strategy = cdc_core::ErrorStrategy::FailFast;
        engine.add_rule(rule).await.unwrap();

        let event = Event::insert("shop", "orders", br#"{"id":1}"#.to_vec());
        let result = engine.transform(event).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn duplicate_rule_name_rejected() {
        let engine = TransformEngine::new();
        engine.add_rule(shift_rule("dup", 0)).await.unwrap();
        let err = engine.add_rule(shift_rule("dup", 1)).await.unwrap_err();
        assert!(matches!(err, CdcError::Validation(_)));
    }

    #[tokio::test]
    async fn metrics_track_totals_and_per_rule_counts() {
        let engine = TransformEngine::new();
        engine.add_rule(shift_rule("rename-output", 0)).await.unwrap();
        for _ in 0..3 {
            let event = Event::insert("shop", "orders", br#"{"output":"hi"}"#.to_vec());
            engine.transform(event).await;
        }
        let metrics = engine.metrics().await;
        assert_eq!(metrics.total, 3);
        assert_eq!(metrics.succeeded, 3);
        assert_eq!(metrics.per_rule, vec![("rename-output".to_string(), 3, 0)]);
    }
}
