//! Compiled declarative JSON-to-JSON rewrite specs, in the `kazaam` shift/
//! concat/coalesce/default/delete family. An [`Action`]'s `spec` field is
//! compiled once into a [`CompiledSpec`] and cached by its canonical JSON
//! string, the same compile-once discipline the teacher applies to
//! registering a DataFusion `SessionContext` table once per SQL transform.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

use crate::condition::resolve_path;

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("unknown action type {0:?}")]
    UnknownActionType(String),
    #[error("malformed spec for action {action:?}: {reason}")]
    Malformed { action: String, reason: String },
    #[error("source path {0:?} not found")]
    SourceNotFound(String),
}

/// A single compiled rewrite operation, built from an [`cdc_core::Action`].
#[derive(Debug, Clone)]
pub enum CompiledSpec {
    /// Move/rename: `{"old.path": "new.path", ...}`.
    Shift(Vec<(String, String)>),
    /// Join several source paths into one string field with a separator.
    Concat {
        sources: Vec<String>,
        target: String,
        separator: String,
    },
    /// First non-null source path wins.
    Coalesce { sources: Vec<String>, target: String },
    /// Set `target` to `value` only if `target` is currently absent.
    Default { target: String, value: Value },
    /// Remove the listed paths.
    Delete(Vec<String>),
}

impl CompiledSpec {
    pub fn compile(action_type: &str, spec: &Value) -> Result<Self, SpecError> {
        match action_type {
            "shift" => {
                let map = spec.as_object().ok_or_else(|| SpecError::Malformed {
                    action: "shift".into(),
                    reason: "spec must be an object of old_path -> new_path".into(),
                })?;
                let mut pairs = Vec::with_capacity(map.len());
                for (old_path, new_path) in map {
                    let new_path = new_path.as_str().ok_or_else(|| SpecError::Malformed {
                        action: "shift".into(),
                        reason: format!("target for {old_path:?} must be a string path"),
                    })?;
                    pairs.push((old_path.clone(), new_path.to_string()));
                }
                Ok(CompiledSpec::Shift(pairs))
            }
            "concat" => {
                let sources = spec
                    .get("sources")
                    .and_then(Value::as_array)
                    .ok_or_else(|| SpecError::Malformed {
                        action: "concat".into(),
                        reason: "missing sources array".into(),
                    })?
                    .iter()
                    .map(|v| v.as_str().unwrap_or_default().to_string())
                    .collect();
                let target = spec
                    .get("target")
                    .and_then(Value::as_str)
                    .ok_or_else(|| SpecError::Malformed {
                        action: "concat".into(),
                        reason: "missing target".into(),
                    })?
                    .to_string();
                let separator = spec
                    .get("separator")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                Ok(CompiledSpec::Concat { sources, target, separator })
            }
            "coalesce" => {
                let sources = spec
                    .get("sources")
                    .and_then(Value::as_array)
                    .ok_or_else(|| SpecError::Malformed {
                        action: "coalesce".into(),
                        reason: "missing sources array".into(),
                    })?
                    .iter()
                    .map(|v| v.as_str().unwrap_or_default().to_string())
                    .collect();
                let target = spec
                    .get("target")
                    .and_then(Value::as_str)
                    .ok_or_else(|| SpecError::Malformed {
                        action: "coalesce".into(),
                        reason: "missing target".into(),
                    })?
                    .to_string();
                Ok(CompiledSpec::Coalesce { sources, target })
            }
            "default" => {
                let target = spec
                    .get("target")
                    .and_then(Value::as_str)
                    .ok_or_else(|| SpecError::Malformed {
                        action: "default".into(),
                        reason: "missing target".into(),
                    })?
                    .to_string();
                let value = spec.get("value").cloned().unwrap_or(Value::Null);
                Ok(CompiledSpec::Default { target, value })
            }
            "delete" => {
                let paths = spec
                    .get("paths")
                    .and_then(Value::as_array)
                    .ok_or_else(|| SpecError::Malformed {
                        action: "delete".into(),
                        reason: "missing paths array".into(),
                    })?
                    .iter()
                    .map(|v| v.as_str().unwrap_or_default().to_string())
                    .collect();
                Ok(CompiledSpec::Delete(paths))
            }
            other => Err(SpecError::UnknownActionType(other.to_string())),
        }
    }

    pub fn apply(&self, input: &Value) -> Result<Value, SpecError> {
        let mut output = input.clone();
        match self {
            CompiledSpec::Shift(pairs) => {
                for (old_path, new_path) in pairs {
                    let value = resolve_path(input, old_path)
                        .cloned()
                        .ok_or_else(|| SpecError::SourceNotFound(old_path.clone()))?;
                    remove_path(&mut output, old_path);
                    set_path(&mut output, new_path, value);
                }
            }
            CompiledSpec::Concat { sources, target, separator } => {
                let joined = sources
                    .iter()
                    .filter_map(|path| resolve_path(input, path))
                    .map(stringify)
                    .collect::<Vec<_>>()
                    .join(separator);
                set_path(&mut output, target, Value::String(joined));
            }
            CompiledSpec::Coalesce { sources, target } => {
                let winner = sources
                    .iter()
                    .find_map(|path| resolve_path(input, path))
                    .cloned()
                    .unwrap_or(Value::Null);
                set_path(&mut output, target, winner);
            }
            CompiledSpec::Default { target, value } => {
                if resolve_path(&output, target).is_none() {
                    set_path(&mut output, target, value.clone());
                }
            }
            CompiledSpec::Delete(paths) => {
                for path in paths {
                    remove_path(&mut output, path);
                }
            }
        }
        Ok(output)
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn set_path(root: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        current = current
            .as_object_mut()
            .unwrap()
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(serde_json::Map::new());
    }
    current
        .as_object_mut()
        .unwrap()
        .insert(segments[segments.len() - 1].to_string(), value);
}

fn remove_path(root: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        match current.as_object_mut().and_then(|m| m.get_mut(*segment)) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(map) = current.as_object_mut() {
        map.remove(segments[segments.len() - 1]);
    }
}

/// Caches compiled specs by their action's canonical JSON string so a rule
/// evaluated against many events compiles its rewrite spec exactly once.
#[derive(Default)]
pub struct SpecCache {
    compiled: DashMap<String, Arc<CompiledSpec>>,
}

impl SpecCache {
    pub fn new() -> Self {
        Self { compiled: DashMap::new() }
    }

    pub fn get_or_compile(&self, action_type: &str, spec: &Value) -> Result<Arc<CompiledSpec>, SpecError> {
        let key = format!("{action_type}:{spec}");
        if let Some(existing) = self.compiled.get(&key) {
            return Ok(existing.clone());
        }
        let compiled = Arc::new(CompiledSpec::compile(action_type, spec)?);
        self.compiled.insert(key, compiled.clone());
        Ok(compiled)
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shift_renames_and_removes_source() {
        let spec = CompiledSpec::compile("shift", &json!({"old_field": "new_field"})).unwrap();
        let input = json!({"old_field": "value", "other": 1});
        let output = spec.apply(&input).unwrap();
        assert_eq!(output["new_field"], json!("value"));
        assert!(output.get("old_field").is_none());
        assert_eq!(output["other"], json!(1));
    }

    #[test]
    fn shift_missing_source_is_error() {
        let spec = CompiledSpec::compile("shift", &json!({"missing": "target"})).unwrap();
        assert!(spec.apply(&json!({})).is_err());
    }

    #[test]
    fn concat_joins_with_separator() {
        let spec = CompiledSpec::compile(
            "concat",
            &json!({"sources": ["first", "last"], "target": "full_name", "separator": " "}),
        )
        .unwrap();
        let output = spec.apply(&json!({"first": "Jane", "last": "Doe"})).unwrap();
        assert_eq!(output["full_name"], json!("Jane Doe"));
    }

    #[test]
    fn coalesce_picks_first_present() {
        let spec = CompiledSpec::compile(
            "coalesce",
            &json!({"sources": ["primary_email", "secondary_email"], "target": "email"}),
        )
        .unwrap();
        let output = spec
            .apply(&json!({"secondary_email": "a@example.com"}))
            .unwrap();
        assert_eq!(output["email"], json!("a@example.com"));
    }

    #[test]
    fn default_does_not_overwrite_existing() {
        let spec = CompiledSpec::compile("default", &json!({"target": "status", "value": "active"})).unwrap();
        let output = spec.apply(&json!({"status": "archived"})).unwrap();
        assert_eq!(output["status"], json!("archived"));
    }

    #[test]
    fn delete_removes_nested_path() {
        let spec = CompiledSpec::compile("delete", &json!({"paths": ["address.zip"]})).unwrap();
        let output = spec.apply(&json!({"address": {"zip": "12345", "city": "X"}})).unwrap();
        assert!(output["address"].get("zip").is_none());
        assert_eq!(output["address"]["city"], json!("X"));
    }

    #[test]
    fn unknown_action_type_rejected() {
        assert!(matches!(
            CompiledSpec::compile("unknown", &json!({})),
            Err(SpecError::UnknownActionType(_))
        ));
    }

    #[test]
    fn spec_cache_reuses_compiled_entry() {
        let cache = SpecCache::new();
        let spec = json!({"target": "status", "value": "active"});
        let first = cache.get_or_compile("default", &spec).unwrap();
        let second = cache.get_or_compile("default", &spec).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }
}
