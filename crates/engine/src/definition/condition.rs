//! Condition expressions for if/then nodes

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::resolve_path;

/// A boolean expression over the run context
///
/// Leaf operators compare the value at a dotted path against a literal.
/// A path that does not resolve makes every comparison false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Exists { path: String },
    NotExists { path: String },
    Equals { path: String, value: Value },
    NotEquals { path: String, value: Value },
    GreaterThan { path: String, value: Value },
    LessThan { path: String, value: Value },
    /// Substring for strings, membership for arrays, key for objects
    Contains { path: String, value: Value },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

impl Condition {
    pub fn exists(path: impl Into<String>) -> Self {
        Self::Exists { path: path.into() }
    }

    pub fn equals(path: impl Into<String>, value: Value) -> Self {
        Self::Equals {
            path: path.into(),
            value,
        }
    }

    pub fn contains(path: impl Into<String>, value: Value) -> Self {
        Self::Contains {
            path: path.into(),
            value,
        }
    }

    /// Evaluate against a context view
    pub fn evaluate(&self, context: &Map<String, Value>) -> bool {
        match self {
            Self::Exists { path } => resolve_path(context, path).is_some_and(|v| !v.is_null()),
            Self::NotExists { path } => resolve_path(context, path).map_or(true, Value::is_null),
            Self::Equals { path, value } => {
                resolve_path(context, path).is_some_and(|actual| values_equal(actual, value))
            }
            Self::NotEquals { path, value } => {
                !resolve_path(context, path).is_some_and(|actual| values_equal(actual, value))
            }
            Self::GreaterThan { path, value } => resolve_path(context, path)
                .and_then(|actual| compare(actual, value))
                .is_some_and(|o| o == Ordering::Greater),
            Self::LessThan { path, value } => resolve_path(context, path)
                .and_then(|actual| compare(actual, value))
                .is_some_and(|o| o == Ordering::Less),
            Self::Contains { path, value } => {
                resolve_path(context, path).is_some_and(|actual| contains(actual, value))
            }
            Self::All { conditions } => conditions.iter().all(|c| c.evaluate(context)),
            Self::Any { conditions } => conditions.iter().any(|c| c.evaluate(context)),
            Self::Not { condition } => !condition.evaluate(context),
        }
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => actual == expected,
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) {
        return a.partial_cmp(&b);
    }
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(actual: &Value, needle: &Value) -> bool {
    match actual {
        Value::String(haystack) => needle.as_str().is_some_and(|n| haystack.contains(n)),
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Map<String, Value> {
        json!({
            "trigger": {
                "email": "ada@example.com",
                "age": 36,
                "tags": ["beta", "vip"],
                "plan": null
            }
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_exists() {
        let ctx = context();
        assert!(Condition::exists("trigger.email").evaluate(&ctx));
        assert!(!Condition::exists("trigger.phone").evaluate(&ctx));
        assert!(!Condition::exists("trigger.plan").evaluate(&ctx));
        assert!(Condition::NotExists {
            path: "trigger.plan".into()
        }
        .evaluate(&ctx));
    }

    #[test]
    fn test_equals_and_numeric_comparison() {
        let ctx = context();
        assert!(Condition::equals("trigger.age", json!(36.0)).evaluate(&ctx));
        assert!(Condition::GreaterThan {
            path: "trigger.age".into(),
            value: json!(18)
        }
        .evaluate(&ctx));
        assert!(!Condition::LessThan {
            path: "trigger.age".into(),
            value: json!(18)
        }
        .evaluate(&ctx));
        assert!(Condition::NotEquals {
            path: "trigger.missing".into(),
            value: json!(1)
        }
        .evaluate(&ctx));
    }

    #[test]
    fn test_contains() {
        let ctx = context();
        assert!(Condition::contains("trigger.email", json!("@")).evaluate(&ctx));
        assert!(Condition::contains("trigger.tags", json!("vip")).evaluate(&ctx));
        assert!(!Condition::contains("trigger.tags", json!("free")).evaluate(&ctx));
        assert!(Condition::contains("trigger", json!("email")).evaluate(&ctx));
    }

    #[test]
    fn test_combinators() {
        let ctx = context();
        let cond = Condition::All {
            conditions: vec![
                Condition::exists("trigger.email"),
                Condition::Any {
                    conditions: vec![
                        Condition::contains("trigger.tags", json!("free")),
                        Condition::contains("trigger.tags", json!("beta")),
                    ],
                },
                Condition::Not {
                    condition: Box::new(Condition::exists("trigger.phone")),
                },
            ],
        };
        assert!(cond.evaluate(&ctx));
    }

    #[test]
    fn test_wire_format() {
        let cond: Condition = serde_json::from_value(json!({
            "op": "all",
            "conditions": [
                {"op": "contains", "path": "trigger.email", "value": "@"},
                {"op": "not", "condition": {"op": "exists", "path": "trigger.phone"}}
            ]
        }))
        .unwrap();
        assert!(cond.evaluate(&context()));
    }
}
