//! Structural adapters between tool-visible shapes and service shapes.
//!
//! Adapters are derived once from a pair of schemas. Derivation refuses
//! shapes that would drop a required service input, so an adapter that
//! exists is total over payloads that validate against the tool schema.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::bounds::{BOUNDS_FIELD, Bounds};
use crate::schema::{ObjectShape, same_type};

/// Service fields never forwarded to the model.
pub const SERVER_ONLY_FIELDS: &[&str] = &["evidence", "internal_calls"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("required input field `{field}` is missing from the tool payload")]
    MissingField { field: String },

    #[error("required input field `{field}` is optional in the tool payload")]
    NotRequired { field: String },

    #[error("field `{field}` has a different type in the tool and service shapes")]
    TypeMismatch { field: String },

    #[error("expected a JSON object for the {which}")]
    NotAnObject { which: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadAdapter {
    fields: Vec<String>,
}

impl PayloadAdapter {
    /// Derive the payload→service adapter, failing when the payload shape
    /// diverges from the service input shape.
    pub fn derive(payload_schema: &Value, input_schema: &Value) -> Result<Self, AdapterError> {
        let payload = ObjectShape::of(payload_schema);
        let input = ObjectShape::of(input_schema);

        for field in &input.required {
            let Some(tool_field) = payload.property(field) else {
                return Err(AdapterError::MissingField {
                    field: field.clone(),
                });
            };
            if !payload.is_required(field) {
                return Err(AdapterError::NotRequired {
                    field: field.clone(),
                });
            }
            if let Some(service_field) = input.property(field)
                && !same_type(tool_field, service_field)
            {
                return Err(AdapterError::TypeMismatch {
                    field: field.clone(),
                });
            }
        }

        Ok(Self {
            fields: input.properties.keys().cloned().collect(),
        })
    }

    pub fn apply(&self, payload: &Value) -> Result<Value, AdapterError> {
        let obj = payload
            .as_object()
            .ok_or(AdapterError::NotAnObject { which: "payload" })?;
        Ok(Value::Object(project(obj, &self.fields)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultAdapter {
    fields: Vec<String>,
    bounded: bool,
}

impl ResultAdapter {
    /// Derive the service→tool-result adapter. Every field the tool result
    /// requires must be produced by the service, except the synthesized
    /// `bounds` envelope.
    pub fn derive(
        output_schema: &Value,
        result_schema: &Value,
        bounded: bool,
    ) -> Result<Self, AdapterError> {
        let output = ObjectShape::of(output_schema);
        let result = ObjectShape::of(result_schema);

        for field in &result.required {
            if field == BOUNDS_FIELD && bounded {
                continue;
            }
            if output.property(field).is_none() {
                return Err(AdapterError::MissingField {
                    field: field.clone(),
                });
            }
        }

        let fields = result
            .properties
            .keys()
            .filter(|k| k.as_str() != BOUNDS_FIELD || !bounded)
            .filter(|k| !SERVER_ONLY_FIELDS.contains(&k.as_str()))
            .cloned()
            .collect();

        Ok(Self { fields, bounded })
    }

    /// Identity projection used when the result schema is the service output.
    pub fn passthrough(output_schema: &Value, bounded: bool) -> Self {
        let fields = ObjectShape::of(output_schema)
            .properties
            .keys()
            .filter(|k| !SERVER_ONLY_FIELDS.contains(&k.as_str()))
            .cloned()
            .collect();
        Self { fields, bounded }
    }

    pub fn apply(&self, output: &Value) -> Result<Value, AdapterError> {
        let obj = output.as_object().ok_or(AdapterError::NotAnObject {
            which: "service result",
        })?;
        let mut projected = project(obj, &self.fields);
        if self.bounded {
            let mut visible = obj.clone();
            for field in SERVER_ONLY_FIELDS {
                visible.remove(*field);
            }
            let bounds = Bounds::synthesize(&Value::Object(visible));
            debug!(
                target: "helm::adapter",
                returned = bounds.returned,
                truncated = bounds.truncated,
                "Synthesized bounds"
            );
            let bounds = serde_json::to_value(bounds)
                .map_err(|_| AdapterError::NotAnObject { which: "bounds" })?;
            projected.insert(BOUNDS_FIELD.to_string(), bounds);
        }
        Ok(Value::Object(projected))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidecarAdapter {
    /// The sidecar is `{ <field>: <service result> }`.
    Wrap { field: String },
    Project { fields: Vec<String> },
}

impl SidecarAdapter {
    pub fn derive(output_schema: &Value, sidecar_schema: &Value) -> Self {
        let sidecar = ObjectShape::of(sidecar_schema);
        if sidecar.properties.len() == 1
            && let Some((field, field_schema)) = sidecar.properties.iter().next()
            && same_type(field_schema, output_schema)
        {
            return Self::Wrap {
                field: field.clone(),
            };
        }
        Self::Project {
            fields: sidecar.properties.keys().cloned().collect(),
        }
    }

    pub fn apply(&self, output: &Value) -> Result<Value, AdapterError> {
        match self {
            SidecarAdapter::Wrap { field } => {
                let mut map = Map::new();
                map.insert(field.clone(), output.clone());
                Ok(Value::Object(map))
            }
            SidecarAdapter::Project { fields } => {
                let obj = output.as_object().ok_or(AdapterError::NotAnObject {
                    which: "service result",
                })?;
                Ok(Value::Object(project(obj, fields)))
            }
        }
    }
}

fn project(obj: &Map<String, Value>, fields: &[String]) -> Map<String, Value> {
    fields
        .iter()
        .filter_map(|f| obj.get(f).map(|v| (f.clone(), v.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "order_id": {"type": "string"},
                "reason": {"type": "string"}
            },
            "required": ["order_id"]
        })
    }

    #[test]
    fn payload_adapter_projects_to_service_input() {
        let adapter = PayloadAdapter::derive(&input_schema(), &input_schema()).unwrap();
        let out = adapter
            .apply(&json!({"order_id": "o1", "extra": true}))
            .unwrap();
        assert_eq!(out, json!({"order_id": "o1"}));
    }

    #[test]
    fn payload_adapter_refuses_dropped_required_field() {
        let payload = json!({"type": "object", "properties": {"reason": {"type": "string"}}});
        assert_eq!(
            PayloadAdapter::derive(&payload, &input_schema()),
            Err(AdapterError::MissingField {
                field: "order_id".into()
            })
        );

        let optional = json!({"type": "object", "properties": {"order_id": {"type": "string"}}});
        assert_eq!(
            PayloadAdapter::derive(&optional, &input_schema()),
            Err(AdapterError::NotRequired {
                field: "order_id".into()
            })
        );

        let retyped = json!({
            "type": "object",
            "properties": {"order_id": {"type": "integer"}},
            "required": ["order_id"]
        });
        assert!(matches!(
            PayloadAdapter::derive(&retyped, &input_schema()),
            Err(AdapterError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn result_adapter_strips_server_only_fields_and_adds_bounds() {
        let output = json!({
            "type": "object",
            "properties": {
                "items": {"type": "array"},
                "total": {"type": "integer"},
                "evidence": {"type": "object"}
            },
            "required": ["items"]
        });
        let mut result = output.clone();
        Bounds::extend_schema(&mut result);

        let adapter = ResultAdapter::derive(&output, &result, true).unwrap();
        let projected = adapter
            .apply(&json!({"items": [1, 2], "total": 5, "evidence": {"sql": "select"}}))
            .unwrap();

        assert!(projected.get("evidence").is_none());
        assert_eq!(projected["items"], json!([1, 2]));
        assert_eq!(projected["bounds"]["returned"], json!(2));
        assert_eq!(projected["bounds"]["truncated"], json!(true));
    }

    #[test]
    fn result_adapter_requires_declared_fields() {
        let output = json!({"type": "object", "properties": {"a": {"type": "string"}}});
        let result = json!({
            "type": "object",
            "properties": {"b": {"type": "string"}},
            "required": ["b"]
        });
        assert!(ResultAdapter::derive(&output, &result, false).is_err());
    }

    #[test]
    fn sidecar_wraps_single_field_of_result_type() {
        let output = json!({"type": "object", "properties": {"id": {"type": "string"}}});
        let sidecar = json!({
            "type": "object",
            "properties": {"order": {"type": "object", "properties": {"id": {"type": "string"}}}}
        });
        let adapter = SidecarAdapter::derive(&output, &sidecar);
        assert_eq!(
            adapter,
            SidecarAdapter::Wrap {
                field: "order".into()
            }
        );
        assert_eq!(
            adapter.apply(&json!({"id": "o1"})).unwrap(),
            json!({"order": {"id": "o1"}})
        );
    }

    #[test]
    fn sidecar_projects_otherwise() {
        let output = json!({"type": "object", "properties": {"id": {"type": "string"}, "n": {"type": "integer"}}});
        let sidecar = json!({"type": "object", "properties": {"n": {"type": "integer"}}});
        let adapter = SidecarAdapter::derive(&output, &sidecar);
        assert_eq!(
            adapter.apply(&json!({"id": "o1", "n": 3})).unwrap(),
            json!({"n": 3})
        );
    }
}
