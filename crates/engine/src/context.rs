//! Context views, path lookup and parameter templating
//!
//! A step sees the run context (root-branch outputs keyed by node id) with
//! its branch scope layered on top. Paths are dotted: `trigger.email`,
//! `orders.items.0.sku`.

use serde_json::{Map, Value};

/// Merge the run context and a step's branch scope; scope entries win
pub fn context_view(run_context: &Map<String, Value>, scope: &Map<String, Value>) -> Map<String, Value> {
    let mut view = run_context.clone();
    for (key, value) in scope {
        view.insert(key.clone(), value.clone());
    }
    view
}

/// Look up a dotted path. Numeric segments index into arrays.
pub fn resolve_path<'a>(context: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.trim().split('.');
    let mut current = context.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Resolve `{{ path }}` templates inside a params value
///
/// A string that is exactly one template is replaced by the referenced
/// value, keeping its JSON type. Templates embedded in longer strings are
/// interpolated as text. Unresolved paths render as `null` (or an empty
/// string when interpolated).
pub fn render_params(params: &Value, context: &Map<String, Value>) -> Value {
    match params {
        Value::String(s) => render_string(s, context),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_params(v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_params(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_string(s: &str, context: &Map<String, Value>) -> Value {
    let trimmed = s.trim();
    if let Some(inner) = trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
    {
        if !inner.contains("{{") && !inner.contains("}}") {
            return resolve_path(context, inner).cloned().unwrap_or(Value::Null);
        }
    }

    if !s.contains("{{") {
        return Value::String(s.to_string());
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                if let Some(value) = resolve_path(context, &after[..end]) {
                    out.push_str(&display_value(value));
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Value::String(out)
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
