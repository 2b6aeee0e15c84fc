//! Argument checking against a tool's input schema.
//!
//! Covers the subset of JSON Schema that tool descriptors declare:
//! `properties`, `required`, per-property `type` (including `items` for
//! arrays), `enum`, and numeric/length bounds. Values that arrive encoded as
//! strings are coerced when the conversion is lossless (`"10"` for an
//! integer, `"true"` for a boolean); anything else is a violation.

use std::fmt;

use serde_json::{Map, Value};

/// One problem with a set of arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Parameter path (`items[2]`), empty for whole-object problems
    pub param: String,
    /// What is wrong
    pub message: String,
}

impl Violation {
    fn new(param: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.param.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "'{}' {}", self.param, self.message)
        }
    }
}

/// Join violations into one line for error messages
#[must_use]
pub fn describe(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Check a schema is usable as a tool input schema.
///
/// Returns a description of the first structural problem found.
pub fn check_schema(schema: &Value) -> Result<(), String> {
    let Some(obj) = schema.as_object() else {
        return Err("input schema must be a JSON object".into());
    };
    match obj.get("type").and_then(Value::as_str) {
        Some("object") => {}
        Some(other) => return Err(format!("input schema type must be \"object\", got \"{other}\"")),
        None => return Err("input schema must declare \"type\": \"object\"".into()),
    }
    if let Some(props) = obj.get("properties") {
        if !props.is_object() {
            return Err("\"properties\" must be an object".into());
        }
    }
    if let Some(required) = obj.get("required") {
        let Some(names) = required.as_array() else {
            return Err("\"required\" must be an array".into());
        };
        let props = obj.get("properties").and_then(Value::as_object);
        for name in names {
            let Some(name) = name.as_str() else {
                return Err("\"required\" entries must be strings".into());
            };
            if !props.is_some_and(|p| p.contains_key(name)) {
                return Err(format!("required parameter '{name}' is not declared"));
            }
        }
    }
    Ok(())
}

/// Validate `arguments` against `schema`, returning the coerced argument
/// object or every violation found.
pub fn validate(arguments: &Value, schema: &Value) -> Result<Map<String, Value>, Vec<Violation>> {
    let args = match arguments {
        Value::Object(m) => m.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(vec![Violation::new(
                "",
                format!("arguments must be an object, got {}", type_name(other)),
            )]);
        }
    };

    let empty = Map::new();
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect::<Vec<_>>())
        .unwrap_or_default();
    let closed = schema
        .get("additionalProperties")
        .and_then(Value::as_bool)
        .is_none_or(|allowed| !allowed);

    let mut violations = Vec::new();

    for name in &required {
        match args.get(*name) {
            None => violations.push(Violation::new(*name, "is required")),
            Some(Value::Null) => violations.push(Violation::new(*name, "must not be null")),
            Some(_) => {}
        }
    }

    if closed {
        for key in args.keys() {
            if !properties.contains_key(key) {
                violations.push(Violation::new(key.as_str(), "is not a known parameter"));
            }
        }
    }

    let mut coerced = Map::new();
    for (name, value) in args {
        match properties.get(&name) {
            Some(prop) if !value.is_null() => match check_value(&name, &value, prop) {
                Ok(v) => {
                    coerced.insert(name, v);
                }
                Err(mut errs) => violations.append(&mut errs),
            },
            _ => {
                coerced.insert(name, value);
            }
        }
    }

    if violations.is_empty() {
        Ok(coerced)
    } else {
        Err(violations)
    }
}

fn check_value(path: &str, value: &Value, schema: &Value) -> Result<Value, Vec<Violation>> {
    let value = match schema.get("type").and_then(Value::as_str) {
        Some(ty) => coerce(value, ty).map_err(|msg| vec![Violation::new(path, msg)])?,
        None => value.clone(),
    };

    let mut violations = Vec::new();

    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        if !options.contains(&value) {
            let shown: Vec<String> = options.iter().map(ToString::to_string).collect();
            violations.push(Violation::new(path, format!("must be one of {}", shown.join(", "))));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                violations.push(Violation::new(path, format!("must be >= {min}")));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                violations.push(Violation::new(path, format!("must be <= {max}")));
            }
        }
    }

    if let Some(s) = value.as_str() {
        let len = s.chars().count() as u64;
        if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
            if len < min {
                violations.push(Violation::new(path, format!("must be at least {min} characters")));
            }
        }
        if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
            if len > max {
                violations.push(Violation::new(path, format!("must be at most {max} characters")));
            }
        }
    }

    let value = match (value, schema.get("items")) {
        (Value::Array(items), Some(item_schema)) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                match check_value(&format!("{path}[{i}]"), item, item_schema) {
                    Ok(v) => out.push(v),
                    Err(mut errs) => violations.append(&mut errs),
                }
            }
            Value::Array(out)
        }
        (other, _) => other,
    };

    if violations.is_empty() {
        Ok(value)
    } else {
        Err(violations)
    }
}

fn coerce(value: &Value, ty: &str) -> Result<Value, String> {
    match (ty, value) {
        ("string", Value::String(_))
        | ("number", Value::Number(_))
        | ("boolean", Value::Bool(_))
        | ("array", Value::Array(_))
        | ("object", Value::Object(_))
        | ("null", Value::Null) => Ok(value.clone()),
        ("integer", Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(value.clone()),
        ("integer", Value::Number(n)) => match n.as_f64() {
            #[allow(clippy::cast_possible_truncation)]
            Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Ok(Value::from(f as i64)),
            _ => Err(format!("expected integer, got {n}")),
        },
        ("integer", Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| format!("expected integer, got \"{s}\"")),
        ("number", Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("expected number, got \"{s}\"")),
        ("boolean", Value::String(s)) => match s.trim() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(format!("expected boolean, got \"{s}\"")),
        },
        ("string" | "integer" | "number" | "boolean" | "array" | "object" | "null", other) => {
            Err(format!("expected {ty}, got {}", type_name(other)))
        }
        // unknown type keyword: accept as-is
        _ => Ok(value.clone()),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
