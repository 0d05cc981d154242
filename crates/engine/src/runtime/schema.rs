//! Argument validation against a tool's declared JSON schema.
//!
//! Covers the subset tool schemas use in practice: `type` (single or list),
//! `required`, `properties`, `additionalProperties`, `enum`, `minimum` /
//! `maximum`, `minLength` / `maxLength` and `items`. Unknown keywords are
//! ignored. Validation is a pure function of `(schema, args)`.

use serde_json::{Map, Value};

/// Nesting deeper than this is not descended into.
const MAX_DEPTH: usize = 16;

/// Check `args` against `schema`. On failure, every problem found is
/// joined into one message.
pub fn validate(schema: &Value, args: &Value) -> Result<(), String> {
    if let Value::String(raw) = args {
        // Providers hand us undecodable argument JSON verbatim.
        if schema_type_names(schema).iter().any(|t| *t == "object") {
            let preview: String = raw.chars().take(80).collect();
            return Err(format!("arguments are not a JSON object: {preview}"));
        }
    }

    let mut errors = Vec::new();
    check(schema, args, "", 0, &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

fn check(schema: &Value, value: &Value, path: &str, depth: usize, errors: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        return;
    };
    if depth > MAX_DEPTH {
        return;
    }

    let types = schema_type_names_map(schema);
    if !types.is_empty() && !types.iter().any(|t| type_matches(t, value)) {
        errors.push(format!(
            "{} should be {} but got {}",
            display(path),
            types.join(" or "),
            value_type_name(value)
        ));
        return;
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            let options: Vec<String> = allowed.iter().map(Value::to_string).collect();
            errors.push(format!("{} must be one of {}", display(path), options.join(", ")));
        }
    }

    match value {
        Value::Object(obj) => check_object(schema, obj, path, depth, errors),
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{path}[{i}]"), depth + 1, errors);
                }
            }
        }
        Value::Number(n) => {
            if let Some(v) = n.as_f64() {
                if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                    if v < min {
                        errors.push(format!("{} must be >= {min}", display(path)));
                    }
                }
                if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                    if v > max {
                        errors.push(format!("{} must be <= {max}", display(path)));
                    }
                }
            }
        }
        Value::String(s) => {
            let len = s.chars().count() as u64;
            if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                if len < min {
                    errors.push(format!("{} must be at least {min} characters", display(path)));
                }
            }
            if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
                if len > max {
                    errors.push(format!("{} must be at most {max} characters", display(path)));
                }
            }
        }
        Value::Bool(_) | Value::Null => {}
    }
}

fn check_object(
    schema: &Map<String, Value>,
    obj: &Map<String, Value>,
    path: &str,
    depth: usize,
    errors: &mut Vec<String>,
) {
    let field = |name: &str| {
        if path.is_empty() {
            name.to_string()
        } else {
            format!("{path}.{name}")
        }
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if obj.get(name).map_or(true, Value::is_null) {
                errors.push(format!("missing required parameter {}", display(&field(name))));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    for (name, value) in obj {
        match properties.and_then(|p| p.get(name)) {
            // Explicit nulls for optional fields are treated as absent.
            Some(_) if value.is_null() => {}
            Some(prop_schema) => check(prop_schema, value, &field(name), depth + 1, errors),
            None => match schema.get("additionalProperties") {
                Some(Value::Bool(false)) => {
                    errors.push(format!("unexpected parameter {}", display(&field(name))));
                }
                Some(extra @ Value::Object(_)) => {
                    check(extra, value, &field(name), depth + 1, errors);
                }
                _ => {}
            },
        }
    }
}

/// `'a.b[2]'`, or `arguments` for the root.
fn display(path: &str) -> String {
    if path.is_empty() {
        "arguments".to_string()
    } else {
        format!("'{path}'")
    }
}

fn schema_type_names(schema: &Value) -> Vec<&str> {
    schema
        .as_object()
        .map(schema_type_names_map)
        .unwrap_or_default()
}

fn schema_type_names_map(schema: &Map<String, Value>) -> Vec<&str> {
    match schema.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(ts)) => ts.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn value_type_name(v: &Value) -> &'static str {
    match v {
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::Null => "null",
    }
}
