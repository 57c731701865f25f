//! Minimal JSON-schema checks for capability inputs and outputs.
//!
//! Supports `type` (string or list), `const`, `enum`, `required`,
//! `properties`, `additionalProperties: false` and `items`. Anything else in
//! the schema is ignored. A `null` or empty schema accepts every value.

use serde_json::Value;

/// Check `value` against `schema`, returning the first violation.
pub fn validate(value: &Value, schema: &Value) -> Result<(), String> {
    if schema.is_null() {
        return Ok(());
    }
    validate_at(value, schema, "$")
}

fn validate_at(value: &Value, schema: &Value, path: &str) -> Result<(), String> {
    let schema_obj = schema
        .as_object()
        .ok_or_else(|| format!("schema at '{path}' must be an object"))?;

    if let Some(type_spec) = schema_obj.get("type") {
        validate_type(value, type_spec, path)?;
    }

    if let Some(constant) = schema_obj.get("const") {
        if value != constant {
            return Err(format!("{path} expected const {constant}"));
        }
    }

    if let Some(variants) = schema_obj.get("enum").and_then(Value::as_array) {
        if !variants.iter().any(|candidate| candidate == value) {
            return Err(format!("{path} is not one of the allowed enum values"));
        }
    }

    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        let object = value
            .as_object()
            .ok_or_else(|| format!("{path} must be an object for required fields"))?;
        for key in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(key) {
                return Err(format!("{path} missing required field '{key}'"));
            }
        }
    }

    if let Some(properties) = schema_obj.get("properties").and_then(Value::as_object) {
        if let Some(object) = value.as_object() {
            for (key, property_schema) in properties {
                if let Some(child) = object.get(key) {
                    validate_at(child, property_schema, &format!("{path}.{key}"))?;
                }
            }

            if schema_obj.get("additionalProperties").and_then(Value::as_bool) == Some(false) {
                if let Some(key) = object.keys().find(|k| !properties.contains_key(*k)) {
                    return Err(format!("{path} contains unknown field '{key}'"));
                }
            }
        }
    }

    if let Some(item_schema) = schema_obj.get("items") {
        if let Some(array) = value.as_array() {
            for (idx, item) in array.iter().enumerate() {
                validate_at(item, item_schema, &format!("{path}[{idx}]"))?;
            }
        }
    }

    Ok(())
}

fn type_matches(type_name: &str, value: &Value) -> bool {
    match type_name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => false,
    }
}

fn validate_type(value: &Value, type_spec: &Value, path: &str) -> Result<(), String> {
    match type_spec {
        Value::String(type_name) => {
            if type_matches(type_name, value) {
                Ok(())
            } else {
                Err(format!("{path} expected type '{type_name}'"))
            }
        }
        Value::Array(types) => {
            if types
                .iter()
                .filter_map(Value::as_str)
                .any(|t| type_matches(t, value))
            {
                Ok(())
            } else {
                Err(format!("{path} did not match any allowed types"))
            }
        }
        _ => Err(format!("{path} schema.type must be string or array")),
    }
}

/// Names listed under `required` at the top of `schema`.
pub fn required_fields(schema: &Value) -> Vec<String> {
    schema["required"]
        .as_array()
        .map(|req| {
            req.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Names of the top-level properties declared by `schema`.
pub fn property_names(schema: &Value) -> Vec<String> {
    schema["properties"]
        .as_object()
        .map(|props| props.keys().cloned().collect())
        .unwrap_or_default()
}

/// JSON-schema type name for a literal value.
pub fn type_of(value: &Value) -> &'static str {
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

/// Object schema whose properties are typed after the given example values.
/// Every listed property is required.
pub fn infer_object_schema<'a>(fields: impl IntoIterator<Item = (&'a str, Option<&'a Value>)>) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for (name, example) in fields {
        let prop = match example {
            Some(v) => serde_json::json!({ "type": type_of(v) }),
            None => serde_json::json!({}),
        };
        properties.insert(name.to_string(), prop);
        required.push(Value::String(name.to_string()));
    }
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// A smoke-test input derivable from the schema alone: `{}` when nothing is
/// required, otherwise `None`.
pub fn synthesize_input(schema: &Value) -> Option<Value> {
    if required_fields(schema).is_empty() {
        Some(serde_json::json!({}))
    } else {
        None
    }
}
