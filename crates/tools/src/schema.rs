//! Argument validation against a tool's declared JSON Schema.
//!
//! Covers the subset of JSON Schema tool definitions actually use:
//! `type`, `properties`, `required`, `enum`, `items` and
//! `additionalProperties: false`. Unknown keywords are ignored.

use serde_json::Value;
use turnflow_core::error::ToolError;
use turnflow_core::provider::ToolDefinition;

/// Validate `arguments` against `schema`.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), ToolError> {
    let mut errors = Vec::new();
    check(schema, arguments, "$", &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ToolError::InvalidArguments(errors.join("; ")))
    }
}

/// Validate a requested call against a catalog: the tool must exist and the
/// arguments must match its schema.
pub fn validate_call(
    catalog: &[ToolDefinition],
    name: &str,
    arguments: &Value,
) -> Result<(), ToolError> {
    let definition = catalog
        .iter()
        .find(|d| d.name == name)
        .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
    validate_arguments(&definition.parameters, arguments)
}

fn check(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type") {
        let matches = match expected {
            Value::String(t) => type_matches(t, value),
            Value::Array(types) => types
                .iter()
                .filter_map(Value::as_str)
                .any(|t| type_matches(t, value)),
            _ => true,
        };
        if !matches {
            errors.push(format!(
                "{path}: expected {}, got {}",
                expected_label(expected),
                type_name(value)
            ));
            return;
        }
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(value) {
            errors.push(format!("{path}: value not in enum"));
        }
    }

    if let Value::Object(fields) = value {
        if let Some(Value::Array(required)) = schema.get("required") {
            for name in required.iter().filter_map(Value::as_str) {
                if !fields.contains_key(name) {
                    errors.push(format!("{path}: missing required property '{name}'"));
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        if let Some(properties) = properties {
            for (name, sub_schema) in properties {
                if let Some(field) = fields.get(name) {
                    check(sub_schema, field, &format!("{path}.{name}"), errors);
                }
            }
        }

        if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
            for name in fields.keys() {
                if !properties.is_some_and(|p| p.contains_key(name)) {
                    errors.push(format!("{path}: unexpected property '{name}'"));
                }
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            check(item_schema, item, &format!("{path}[{i}]"), errors);
        }
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn expected_label(expected: &Value) -> String {
    match expected {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn weather_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "city": { "type": "string" },
                "days": { "type": "integer" },
                "units": { "type": "string", "enum": ["metric", "imperial"] },
                "tags": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["city"]
        })
    }

    #[test]
    fn accepts_valid_arguments() {
        let args = json!({"city": "Oslo", "days": 3, "units": "metric", "tags": ["a"]});
        assert!(validate_arguments(&weather_schema(), &args).is_ok());
    }

    #[test]
    fn rejects_missing_required() {
        let err = validate_arguments(&weather_schema(), &json!({"days": 1})).unwrap_err();
        assert!(err.to_string().contains("missing required property 'city'"));
    }

    #[test]
    fn rejects_wrong_type() {
        let err = validate_arguments(&weather_schema(), &json!({"city": 42})).unwrap_err();
        assert!(err.to_string().contains("$.city: expected string, got integer"));
    }

    #[test]
    fn integer_rejects_fraction() {
        let err = validate_arguments(&weather_schema(), &json!({"city": "x", "days": 1.5}))
            .unwrap_err();
        assert!(err.to_string().contains("$.days"));
    }

    #[test]
    fn rejects_value_outside_enum() {
        let args = json!({"city": "x", "units": "kelvin"});
        assert!(validate_arguments(&weather_schema(), &args).is_err());
    }

    #[test]
    fn checks_array_items() {
        let args = json!({"city": "x", "tags": ["ok", 3]});
        let err = validate_arguments(&weather_schema(), &args).unwrap_err();
        assert!(err.to_string().contains("$.tags[1]"));
    }

    #[test]
    fn rejects_non_object_arguments() {
        assert!(validate_arguments(&weather_schema(), &json!("Oslo")).is_err());
    }

    #[test]
    fn additional_properties_false() {
        let schema = json!({
            "type": "object",
            "properties": { "a": { "type": "string" } },
            "additionalProperties": false
        });
        assert!(validate_arguments(&schema, &json!({"a": "x"})).is_ok());
        assert!(validate_arguments(&schema, &json!({"a": "x", "b": 1})).is_err());
    }

    #[test]
    fn empty_schema_accepts_anything() {
        assert!(validate_arguments(&json!({}), &json!({"anything": [1, 2]})).is_ok());
    }

    #[test]
    fn validate_call_unknown_tool() {
        let catalog = vec![ToolDefinition {
            name: "weather".into(),
            description: String::new(),
            parameters: weather_schema(),
        }];
        assert!(matches!(
            validate_call(&catalog, "stocks", &json!({})),
            Err(ToolError::NotFound(_))
        ));
        assert!(validate_call(&catalog, "weather", &json!({"city": "Rome"})).is_ok());
    }
}
