use schemars::JsonSchema;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Render `T` as a self-contained draft-07 JSON Schema.
///
/// Subschemas are inlined so tool schemas never carry `$ref`/`definitions`,
/// which also rules out cyclic types.
pub fn schema_for<T: JsonSchema>() -> Value {
    let settings = schemars::generate::SchemaSettings::draft07().with(|s| {
        s.inline_subschemas = true;
    });
    let generator = settings.into_generator();
    let schema = generator.into_root_schema_for::<T>();
    schema.to_value()
}

/// The top-level object shape of a schema: its properties and the set of
/// required property names, with `allOf` merged and `oneOf`/`anyOf` reduced
/// to the properties every branch requires.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectShape {
    pub properties: Map<String, Value>,
    pub required: BTreeSet<String>,
}

impl ObjectShape {
    pub fn of(schema: &Value) -> Self {
        let mut shape = Self::default();
        shape.merge(schema);
        shape
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.required.contains(name)
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    fn merge(&mut self, schema: &Value) {
        let Some(obj) = schema.as_object() else {
            return;
        };

        if let Some(props) = obj.get("properties").and_then(Value::as_object) {
            for (key, value) in props {
                self.properties
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
        }

        if let Some(req) = obj.get("required").and_then(Value::as_array) {
            self.required
                .extend(req.iter().filter_map(Value::as_str).map(str::to_string));
        }

        if let Some(all_of) = obj.get("allOf").and_then(Value::as_array) {
            for sub in all_of {
                self.merge(sub);
            }
        }

        for key in ["oneOf", "anyOf"] {
            if let Some(branches) = obj.get(key).and_then(Value::as_array) {
                self.merge_branches(branches);
            }
        }
    }

    fn merge_branches(&mut self, branches: &[Value]) {
        let mut common: Option<BTreeSet<String>> = None;
        for branch in branches {
            let sub = ObjectShape::of(branch);
            for (key, value) in sub.properties {
                self.properties.entry(key).or_insert(value);
            }
            common = Some(match common.take() {
                None => sub.required,
                Some(existing) => existing.intersection(&sub.required).cloned().collect(),
            });
        }
        if let Some(common) = common {
            self.required.extend(common);
        }
    }
}

/// Compare two property schemas ignoring documentation-only keywords.
pub fn same_type(a: &Value, b: &Value) -> bool {
    strip_annotations(a) == strip_annotations(b)
}

fn strip_annotations(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| {
                    !matches!(
                        k.as_str(),
                        "description" | "title" | "$schema" | "examples" | "default"
                    )
                })
                .map(|(k, v)| (k.clone(), strip_annotations(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_annotations).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, JsonSchema)]
    #[expect(dead_code)]
    struct ListOrders {
        /// Customer to list orders for
        customer_id: String,
        limit: Option<u32>,
    }

    #[test]
    fn generated_schema_has_no_refs() {
        let schema = schema_for::<ListOrders>();
        let text = schema.to_string();
        assert!(!text.contains("$ref"));
        let shape = ObjectShape::of(&schema);
        assert!(shape.is_required("customer_id"));
        assert!(!shape.is_required("limit"));
        assert!(shape.property("limit").is_some());
    }

    #[test]
    fn one_of_requires_only_common_fields() {
        let schema = json!({
            "oneOf": [
                {"properties": {"a": {"type": "string"}, "b": {"type": "string"}}, "required": ["a", "b"]},
                {"properties": {"a": {"type": "string"}, "c": {"type": "string"}}, "required": ["a"]}
            ]
        });
        let shape = ObjectShape::of(&schema);
        assert_eq!(shape.required.iter().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(shape.properties.len(), 3);
    }

    #[test]
    fn same_type_ignores_descriptions() {
        let a = json!({"type": "string", "description": "x"});
        let b = json!({"type": "string"});
        assert!(same_type(&a, &b));
        assert!(!same_type(&a, &json!({"type": "integer"})));
    }
}
