use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Pagination envelope attached to bounded tool results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub returned: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refinement_hint: Option<String>,
}

pub const BOUNDS_FIELD: &str = "bounds";

impl Bounds {
    pub fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "returned": { "type": "integer", "minimum": 0 },
                "total": { "type": ["integer", "null"], "minimum": 0 },
                "truncated": { "type": "boolean" },
                "refinement_hint": { "type": ["string", "null"] }
            },
            "required": ["returned", "truncated"]
        })
    }

    /// Add the `bounds` property to an object schema and mark it required.
    pub fn extend_schema(schema: &mut Value) {
        let Some(obj) = schema.as_object_mut() else {
            return;
        };
        let props = obj
            .entry("properties")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(props) = props.as_object_mut() {
            props.insert(BOUNDS_FIELD.to_string(), Self::schema());
        }
        let required = obj
            .entry("required")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(required) = required.as_array_mut()
            && !required.iter().any(|r| r == BOUNDS_FIELD)
        {
            required.push(Value::String(BOUNDS_FIELD.to_string()));
        }
    }

    /// Read bounds from a service result. An explicit `bounds` object wins;
    /// otherwise the top-level `returned`/`total`/`truncated`/`refinement_hint`
    /// fields are used. `returned` falls back to the length of the first
    /// array-valued field.
    pub fn synthesize(service_result: &Value) -> Self {
        if let Some(explicit) = service_result.get(BOUNDS_FIELD)
            && let Ok(bounds) = serde_json::from_value::<Bounds>(explicit.clone())
        {
            return bounds;
        }

        let returned = service_result
            .get("returned")
            .and_then(Value::as_u64)
            .or_else(|| {
                service_result.as_object().and_then(|obj| {
                    obj.values()
                        .find_map(|v| v.as_array().map(|a| a.len() as u64))
                })
            })
            .unwrap_or(0);
        let total = service_result.get("total").and_then(Value::as_u64);
        let truncated = service_result
            .get("truncated")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| total.is_some_and(|t| t > returned));
        let refinement_hint = service_result
            .get("refinement_hint")
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            returned,
            total,
            truncated,
            refinement_hint,
        }
    }
}
