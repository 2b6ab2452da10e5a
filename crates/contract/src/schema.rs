//! Compiled schema checking
//!
//! A pragmatic subset of JSON Schema, enough to validate the
//! LingoReel API contract: type, properties/required, items, enum,
//! nullable, string length, numeric bounds, and the uuid format.

use serde_json::Value;

/// How forgiving validation is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Unknown fields ignored, string→number/bool coercion permitted
    #[default]
    Lenient,
    /// Undeclared fields and uncoerced type mismatches are violations
    Strict,
}

/// One normalized validation failure
#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidationError {
    /// JSON-pointer-ish location within the payload
    pub path: String,
    pub message: String,
    pub expected: String,
    pub actual: Value,
}

/// A schema resolved and ready to run against payloads
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    schema: Value,
}

impl CompiledSchema {
    pub fn new(schema: Value) -> Self {
        Self { schema }
    }

    pub fn validate(&self, value: &Value, mode: ValidationMode) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        check(&self.schema, value, "", mode, &mut errors);
        errors
    }

    /// Copy of the value with fields the schema does not declare
    /// removed, recursively
    pub fn strip_undeclared(&self, value: &Value) -> Value {
        strip(&self.schema, value)
    }
}

fn strip(schema: &Value, value: &Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return value.clone();
    };
    match (obj.get("type").and_then(Value::as_str), value) {
        (Some("object"), Value::Object(map)) => {
            let Some(props) = obj.get("properties").and_then(Value::as_object) else {
                return value.clone();
            };
            let mut out = serde_json::Map::new();
            for (name, field) in map {
                if let Some(prop_schema) = props.get(name) {
                    out.insert(name.clone(), strip(prop_schema, field));
                }
            }
            Value::Object(out)
        }
        (Some("array"), Value::Array(items)) => match obj.get("items") {
            Some(item_schema) => {
                Value::Array(items.iter().map(|v| strip(item_schema, v)).collect())
            }
            None => value.clone(),
        },
        _ => value.clone(),
    }
}

fn push(errors: &mut Vec<ValidationError>, path: &str, message: String, expected: &str, actual: &Value) {
    errors.push(ValidationError {
        path: if path.is_empty() { "/".to_string() } else { path.to_string() },
        message,
        expected: expected.to_string(),
        actual: actual.clone(),
    });
}

fn check(schema: &Value, value: &Value, path: &str, mode: ValidationMode, errors: &mut Vec<ValidationError>) {
    let Some(obj) = schema.as_object() else {
        return; // non-object schema fragments accept anything
    };

    if value.is_null() {
        if obj.get("nullable").and_then(Value::as_bool).unwrap_or(false) {
            return;
        }
        if obj.get("type").is_some() {
            push(errors, path, "value is null".into(), type_name(obj), value);
        }
        return;
    }

    if let Some(allowed) = obj.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            push(
                errors,
                path,
                format!("value not in enum {allowed:?}"),
                "enum member",
                value,
            );
            return;
        }
    }

    match obj.get("type").and_then(Value::as_str) {
        Some("object") => check_object(obj, value, path, mode, errors),
        Some("array") => check_array(obj, value, path, mode, errors),
        Some("string") => check_string(obj, value, path, errors),
        Some("number") => check_number(obj, value, path, mode, false, errors),
        Some("integer") => check_number(obj, value, path, mode, true, errors),
        Some("boolean") => check_boolean(value, path, mode, errors),
        Some("null") => {
            // Non-null handled above
            push(errors, path, "expected null".into(), "null", value);
        }
        _ => {}
    }
}

fn type_name(obj: &serde_json::Map<String, Value>) -> &str {
    obj.get("type").and_then(Value::as_str).unwrap_or("any")
}

fn check_object(
    obj: &serde_json::Map<String, Value>,
    value: &Value,
    path: &str,
    mode: ValidationMode,
    errors: &mut Vec<ValidationError>,
) {
    let Some(map) = value.as_object() else {
        push(errors, path, "expected object".into(), "object", value);
        return;
    };

    let properties = obj.get("properties").and_then(Value::as_object);

    if let Some(required) = obj.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !map.contains_key(name) {
                push(
                    errors,
                    &format!("{path}/{name}"),
                    format!("missing required field '{name}'"),
                    "present",
                    &Value::Null,
                );
            }
        }
    }

    if let Some(props) = properties {
        for (name, prop_schema) in props {
            if let Some(field) = map.get(name) {
                check(prop_schema, field, &format!("{path}/{name}"), mode, errors);
            }
        }

        let extras_forbidden = mode == ValidationMode::Strict
            || obj.get("additionalProperties") == Some(&Value::Bool(false));
        if extras_forbidden {
            for name in map.keys() {
                if !props.contains_key(name) {
                    push(
                        errors,
                        &format!("{path}/{name}"),
                        format!("undeclared field '{name}'"),
                        "declared field",
                        &map[name],
                    );
                }
            }
        }
    }
}

fn check_array(
    obj: &serde_json::Map<String, Value>,
    value: &Value,
    path: &str,
    mode: ValidationMode,
    errors: &mut Vec<ValidationError>,
) {
    let Some(items) = value.as_array() else {
        push(errors, path, "expected array".into(), "array", value);
        return;
    };

    if let Some(item_schema) = obj.get("items") {
        for (i, item) in items.iter().enumerate() {
            check(item_schema, item, &format!("{path}/{i}"), mode, errors);
        }
    }
}

fn check_string(
    obj: &serde_json::Map<String, Value>,
    value: &Value,
    path: &str,
    errors: &mut Vec<ValidationError>,
) {
    let Some(s) = value.as_str() else {
        push(errors, path, "expected string".into(), "string", value);
        return;
    };

    if let Some(min) = obj.get("minLength").and_then(Value::as_u64) {
        if (s.chars().count() as u64) < min {
            push(
                errors,
                path,
                format!("string shorter than minLength {min}"),
                &format!("length >= {min}"),
                value,
            );
        }
    }
    if let Some(max) = obj.get("maxLength").and_then(Value::as_u64) {
        if (s.chars().count() as u64) > max {
            push(
                errors,
                path,
                format!("string longer than maxLength {max}"),
                &format!("length <= {max}"),
                value,
            );
        }
    }
    if obj.get("format").and_then(Value::as_str) == Some("uuid")
        && uuid::Uuid::parse_str(s).is_err()
    {
        push(errors, path, "not a valid uuid".into(), "uuid", value);
    }
}

fn check_number(
    obj: &serde_json::Map<String, Value>,
    value: &Value,
    path: &str,
    mode: ValidationMode,
    integer: bool,
    errors: &mut Vec<ValidationError>,
) {
    let expected = if integer { "integer" } else { "number" };

    let n = match value {
        Value::Number(n) => Some(n.as_f64().unwrap_or(f64::NAN)),
        // Lenient mode coerces numeric strings
        Value::String(s) if mode == ValidationMode::Lenient => s.parse::<f64>().ok(),
        _ => None,
    };

    let Some(n) = n else {
        push(errors, path, format!("expected {expected}"), expected, value);
        return;
    };

    if integer && n.fract() != 0.0 {
        push(errors, path, "expected integer".into(), expected, value);
        return;
    }

    if let Some(min) = obj.get("minimum").and_then(Value::as_f64) {
        if n < min {
            push(
                errors,
                path,
                format!("value below minimum {min}"),
                &format!(">= {min}"),
                value,
            );
        }
    }
    if let Some(max) = obj.get("maximum").and_then(Value::as_f64) {
        if n > max {
            push(
                errors,
                path,
                format!("value above maximum {max}"),
                &format!("<= {max}"),
                value,
            );
        }
    }
}

fn check_boolean(value: &Value, path: &str, mode: ValidationMode, errors: &mut Vec<ValidationError>) {
    match value {
        Value::Bool(_) => {}
        Value::String(s)
            if mode == ValidationMode::Lenient && (s == "true" || s == "false") => {}
        _ => push(errors, path, "expected boolean".into(), "boolean", value),
    }
}
