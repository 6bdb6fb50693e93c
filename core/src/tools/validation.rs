/// Argument coercion and validation against a tool's input schema
use super::error::{ToolError, ToolResult};
use crate::mcp::ToolDescriptor;
use serde_json::{Map, Number, Value};

/// Stringify numeric arguments that the tool expects as strings.
///
/// A field qualifies when its schema property declares `"type": "string"`,
/// or when its name is listed in `stringify_fields` and the schema does not
/// declare it numeric. Non-object input is returned unchanged so validation
/// can report it.
pub fn coerce_arguments(tool: &ToolDescriptor, arguments: Value, stringify_fields: &[String]) -> Value {
    let Value::Object(map) = arguments else {
        return arguments;
    };

    let coerced = map
        .into_iter()
        .map(|(key, value)| {
            let wants_string = match tool.property_type(&key).as_deref() {
                Some("string") => true,
                Some("number") | Some("integer") => false,
                _ => stringify_fields.iter().any(|f| f == &key),
            };
            let value = match value {
                Value::Number(ref n) if wants_string => Value::String(number_to_string(n)),
                other => other,
            };
            (key, value)
        })
        .collect();

    Value::Object(coerced)
}

/// Integral floats print without a fractional part ("10", not "10.0")
fn number_to_string(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}

/// Check arguments against the schema and return them as an object.
///
/// `null` counts as "no arguments". Properties the schema does not declare
/// pass through untouched.
pub fn validate_arguments(tool: &ToolDescriptor, arguments: Value) -> ToolResult<Map<String, Value>> {
    let map = match arguments {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(ToolError::invalid(
                &tool.name,
                format!("arguments must be an object, got {}", type_name(&other)),
            ))
        }
    };

    for field in tool.required() {
        match map.get(&field) {
            None | Some(Value::Null) => {
                return Err(ToolError::invalid(
                    &tool.name,
                    format!("missing required field '{}'", field),
                ))
            }
            Some(_) => {}
        }
    }

    for (field, schema) in tool.properties() {
        let Some(value) = map.get(&field) else {
            continue;
        };
        let Some(expected) = schema.get("type") else {
            continue;
        };

        let matches = match expected {
            Value::String(tag) => type_matches(tag, value),
            Value::Array(tags) => tags
                .iter()
                .filter_map(Value::as_str)
                .any(|tag| type_matches(tag, value)),
            _ => true,
        };

        if !matches {
            return Err(ToolError::invalid(
                &tool.name,
                format!(
                    "field '{}' must be {}, got {}",
                    field,
                    expected_label(expected),
                    type_name(value)
                ),
            ));
        }
    }

    Ok(map)
}

fn type_matches(tag: &str, value: &Value) -> bool {
    match tag {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false)
        }
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        // Unknown tags are not ours to enforce
        _ => true,
    }
}

fn expected_label(expected: &Value) -> String {
    match expected {
        Value::String(tag) => tag.clone(),
        Value::Array(tags) => tags
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
