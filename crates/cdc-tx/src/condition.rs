//! Condition evaluation against an event's decoded JSON body.

use cdc_core::{Condition, ConditionOperator};
use serde_json::Value;

/// Resolves a dotted path (`"address.city"`) against a JSON object. Missing
/// intermediate segments resolve to `None` rather than erroring — only
/// `Exists` distinguishes "absent" from "present but null".
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Evaluates a single condition against `data`. All comparisons coerce to
/// string representation except `Exists`, `In`, and `NotIn`, which work on
/// the resolved value directly.
pub fn evaluate(condition: &Condition, data: &Value) -> bool {
    let resolved = resolve_path(data, &condition.field);

    match condition.operator {
        ConditionOperator::Exists => resolved.is_some(),
        ConditionOperator::In => match resolved {
            Some(value) => condition
                .value
                .as_array()
                .map(|arr| arr.contains(value))
                .unwrap_or(false),
            None => false,
        },
        ConditionOperator::NotIn => match resolved {
            Some(value) => condition
                .value
                .as_array()
                .map(|arr| !arr.contains(value))
                .unwrap_or(true),
            None => true,
        },
        _ => {
            let Some(resolved) = resolved else {
                return false;
            };
            let lhs = stringify(resolved);
            let rhs = stringify(&condition.value);
            match condition.operator {
                ConditionOperator::Eq => lhs == rhs,
                ConditionOperator::Ne => lhs != rhs,
                ConditionOperator::Gt => compare_numeric_or_lexical(&lhs, &rhs) == std::cmp::Ordering::Greater,
                ConditionOperator::Lt => compare_numeric_or_lexical(&lhs, &rhs) == std::cmp::Ordering::Less,
                ConditionOperator::Gte => compare_numeric_or_lexical(&lhs, &rhs) != std::cmp::Ordering::Less,
                ConditionOperator::Lte => compare_numeric_or_lexical(&lhs, &rhs) != std::cmp::Ordering::Greater,
                ConditionOperator::Contains => lhs.contains(&rhs),
                ConditionOperator::Exists | ConditionOperator::In | ConditionOperator::NotIn => unreachable!(),
            }
        }
    }
}

fn compare_numeric_or_lexical(lhs: &str, rhs: &str) -> std::cmp::Ordering {
    match (lhs.parse::<f64>(), rhs.parse::<f64>()) {
        (Ok(l), Ok(r)) => l.partial_cmp(&r).unwrap_or(std::cmp::Ordering::Equal),
        _ => lhs.cmp(rhs),
    }
}

/// AND-semantics over the rule's condition list. An empty list always
/// matches.
pub fn matches_all(conditions: &[Condition], data: &Value) -> bool {
    conditions.iter().all(|c| evaluate(c, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(field: &str, op: ConditionOperator, value: Value) -> Condition {
        Condition {
            field: field.to_string(),
            operator: op,
            value,
            type_hint: None,
        }
    }

    #[test]
    fn exists_distinguishes_missing_from_null() {
        let data = json!({"a": {"b": null}});
        assert!(evaluate(&cond("a.b", ConditionOperator::Exists, Value::Null), &data));
        assert!(!evaluate(&cond("a.c", ConditionOperator::Exists, Value::Null), &data));
        assert!(!evaluate(&cond("x.y", ConditionOperator::Exists, Value::Null), &data));
    }

    #[test]
    fn numeric_ordering_uses_parsed_values_not_lexical() {
        let data = json!({"amount": 9});
        assert!(evaluate(&cond("amount", ConditionOperator::Gt, json!(10)), &data) == false);
        assert!(evaluate(&cond("amount", ConditionOperator::Lt, json!(10)), &data));
    }

    #[test]
    fn contains_is_substring_on_stringified_value() {
        let data = json!({"name": "Jane Doe"});
        assert!(evaluate(&cond("name", ConditionOperator::Contains, json!("Doe")), &data));
    }

    #[test]
    fn empty_condition_list_always_matches() {
        let data = json!({});
        assert!(matches_all(&[], &data));
    }

    #[test]
    fn missing_path_segment_is_false_not_error() {
        let data = json!({"a": 1});
        assert!(!evaluate(&cond("a.b.c", ConditionOperator::Eq, json!("x")), &data));
    }
}
