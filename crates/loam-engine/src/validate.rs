use serde_json::Value;

/// A shape-validation failure, phrased so the model can correct itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub detail: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid tool input: {}", self.detail)
    }
}

/// Validate a tool-call payload's *shape* against the adapter's input
/// schema: required keys present, top-level types correct, no forbidden
/// extras. Semantic and runtime errors (bad syntax inside a string field,
/// logic errors) are deliberately not caught here — those are session
/// data for the learning loop.
pub fn validate_shape(schema: &Value, payload: &Value) -> Result<(), ValidationError> {
    let Some(obj) = payload.as_object() else {
        return Err(ValidationError {
            detail: format!("payload must be a JSON object, got {}", json_type(payload)),
        });
    };

    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();

    // Required keys
    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !obj.contains_key(key) {
                return Err(ValidationError {
                    detail: format!("missing required key {key:?}"),
                });
            }
        }
    }

    // Top-level types
    for (key, value) in obj {
        if let Some(prop_schema) = properties.get(key) {
            if let Some(expected) = prop_schema.get("type").and_then(|t| t.as_str()) {
                if !type_matches(expected, value) {
                    return Err(ValidationError {
                        detail: format!(
                            "key {key:?} must be {expected}, got {}",
                            json_type(value)
                        ),
                    });
                }
            }
        }
    }

    // Forbidden extras
    let additional_allowed = schema
        .get("additionalProperties")
        .and_then(|a| a.as_bool())
        .unwrap_or(true);
    if !additional_allowed {
        for key in obj.keys() {
            if !properties.contains_key(key) {
                return Err(ValidationError {
                    detail: format!("unexpected key {key:?}"),
                });
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
