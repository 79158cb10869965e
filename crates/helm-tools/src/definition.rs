use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::bounds::Bounds;
use crate::schema::schema_for;
use crate::template::{PromptTemplate, TemplateError};

/// `<toolset>.<tool>`, the identifier used in the schema catalog file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ToolId {
    pub toolset: String,
    pub name: String,
}

impl ToolId {
    pub fn new(toolset: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            toolset: toolset.into(),
            name: name.into(),
        }
    }

    /// Split `toolset.tool` at the last dot.
    pub fn parse(id: &str) -> Option<Self> {
        let (toolset, name) = id.rsplit_once('.')?;
        if toolset.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(toolset, name))
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.toolset, self.name)
    }
}

/// A named JSON Schema, e.g. the rendering of a service operation's input type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedSchema {
    pub name: String,
    pub schema: Value,
}

impl TypedSchema {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }

    pub fn of<T: JsonSchema>() -> Self {
        Self::new(T::schema_name(), schema_for::<T>())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationPolicy {
    pub title: String,
    pub prompt_template: String,
    pub denied_result_template: String,
}

impl ConfirmationPolicy {
    pub fn new(
        title: impl Into<String>,
        prompt_template: impl Into<String>,
        denied_result_template: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            prompt_template: prompt_template.into(),
            denied_result_template: denied_result_template.into(),
        }
    }

    pub fn render_prompt(&self, payload: &Value) -> Result<String, TemplateError> {
        Ok(PromptTemplate::parse(&self.prompt_template)?.render(payload))
    }

    pub fn render_denied(&self, payload: &Value) -> Result<String, TemplateError> {
        Ok(PromptTemplate::parse(&self.denied_result_template)?.render(payload))
    }
}

/// Where an invocation is routed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolProvider {
    MethodBacked { service: String, method: String },
    Mcp { server: String, tool: String },
    RegistryBacked { namespace: String, remote_id: String },
}

impl ToolProvider {
    pub fn label(&self) -> &'static str {
        match self {
            ToolProvider::MethodBacked { .. } => "method",
            ToolProvider::Mcp { .. } => "mcp",
            ToolProvider::RegistryBacked { .. } => "registry",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Safe to re-dispatch after a crash left the call unacknowledged.
    #[serde(default)]
    pub idempotent: bool,
    /// At most one invocation of this tool in flight per run.
    #[serde(default)]
    pub serial: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: ToolId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<TypedSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TypedSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar: Option<TypedSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<ConfirmationPolicy>,
    #[serde(default)]
    pub bounded: bool,
    pub provider: ToolProvider,
    #[serde(default)]
    pub policy: ExecutionPolicy,
}

impl ToolDefinition {
    pub fn new(id: ToolId, provider: ToolProvider) -> Self {
        Self {
            title: id.name.clone(),
            id,
            service: None,
            description: String::new(),
            tags: Vec::new(),
            payload: None,
            result: None,
            sidecar: None,
            confirmation: None,
            bounded: false,
            provider,
            policy: ExecutionPolicy::default(),
        }
    }

    /// `service.toolset.tool` when the tool belongs to a service, otherwise
    /// `toolset.tool`. Lookups on this name are case-sensitive.
    pub fn qualified_name(&self) -> String {
        match &self.service {
            Some(service) => format!("{service}.{}", self.id),
            None => self.id.to_string(),
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_payload(mut self, payload: TypedSchema) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets the result schema. Bounded tools get the `bounds` envelope added.
    pub fn with_result(mut self, result: TypedSchema) -> Self {
        self.result = Some(result);
        self.apply_bounds_envelope();
        self
    }

    pub fn with_sidecar(mut self, sidecar: TypedSchema) -> Self {
        self.sidecar = Some(sidecar);
        self
    }

    pub fn with_confirmation(mut self, confirmation: ConfirmationPolicy) -> Self {
        self.confirmation = Some(confirmation);
        self
    }

    pub fn bounded(mut self) -> Self {
        self.bounded = true;
        self.apply_bounds_envelope();
        self
    }

    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn requires_confirmation(&self) -> bool {
        self.confirmation.is_some()
    }

    /// Payload schema, or the empty object schema for parameterless tools.
    pub fn payload_schema(&self) -> Value {
        self.payload
            .as_ref()
            .map_or_else(empty_object_schema, |p| p.schema.clone())
    }

    pub fn result_schema(&self) -> Value {
        self.result
            .as_ref()
            .map_or_else(empty_object_schema, |r| r.schema.clone())
    }

    fn apply_bounds_envelope(&mut self) {
        if !self.bounded {
            return;
        }
        if let Some(result) = self.result.as_mut() {
            Bounds::extend_schema(&mut result.schema);
        }
    }

    /// Check the definition against the tool contract: identifier syntax,
    /// object-typed schemas and parseable confirmation templates.
    pub fn validate(&self) -> Result<(), ContractError> {
        for part in [&self.id.toolset, &self.id.name] {
            if part.is_empty() {
                return Err(ContractError::EmptyName);
            }
            if !part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            {
                return Err(ContractError::InvalidName {
                    name: self.id.to_string(),
                });
            }
        }

        for (which, schema) in [
            ("payload", &self.payload),
            ("result", &self.result),
            ("sidecar", &self.sidecar),
        ] {
            if let Some(schema) = schema
                && !schema.schema.is_object()
            {
                return Err(ContractError::SchemaNotObject {
                    tool: self.id.to_string(),
                    which,
                });
            }
        }

        if let Some(confirmation) = &self.confirmation {
            for template in [
                &confirmation.prompt_template,
                &confirmation.denied_result_template,
            ] {
                PromptTemplate::parse(template).map_err(|source| ContractError::Template {
                    tool: self.id.to_string(),
                    source,
                })?;
            }
        }

        Ok(())
    }
}

fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContractError {
    #[error("tool name must not be empty")]
    EmptyName,

    #[error("invalid tool name: {name}")]
    InvalidName { name: String },

    #[error("{which} schema of {tool} is not a JSON object")]
    SchemaNotObject { tool: String, which: &'static str },

    #[error("confirmation template of {tool}: {source}")]
    Template {
        tool: String,
        #[source]
        source: TemplateError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(toolset: &str, name: &str) -> ToolDefinition {
        ToolDefinition::new(
            ToolId::new(toolset, name),
            ToolProvider::MethodBacked {
                service: "svc".into(),
                method: name.into(),
            },
        )
    }

    #[test]
    fn qualified_name_includes_service_when_present() {
        let def = method("todos", "list");
        assert_eq!(def.qualified_name(), "todos.list");
        assert_eq!(def.with_service("crm").qualified_name(), "crm.todos.list");
    }

    #[test]
    fn tool_id_parses_last_segment() {
        let id = ToolId::parse("crm.orders.cancel").unwrap();
        assert_eq!(id.toolset, "crm.orders");
        assert_eq!(id.name, "cancel");
        assert!(ToolId::parse("nodot").is_none());
        assert!(ToolId::parse(".x").is_none());
    }

    #[test]
    fn bounded_results_gain_bounds_property() {
        let def = method("orders", "search")
            .with_result(TypedSchema::new(
                "SearchResult",
                json!({"type": "object", "properties": {"items": {"type": "array"}}}),
            ))
            .bounded();
        let schema = def.result_schema();
        assert!(schema["properties"]["bounds"].is_object());
        assert!(
            schema["required"]
                .as_array()
                .unwrap()
                .contains(&json!("bounds"))
        );
    }

    #[test]
    fn validate_rejects_broken_templates_and_names() {
        let ok = method("orders", "cancel").with_confirmation(ConfirmationPolicy::new(
            "Cancel order",
            "Cancel {{orderId}}?",
            "User declined",
        ));
        assert!(ok.validate().is_ok());

        let bad_template = method("orders", "cancel").with_confirmation(ConfirmationPolicy::new(
            "Cancel order",
            "Cancel {{orderId?",
            "User declined",
        ));
        assert!(matches!(
            bad_template.validate(),
            Err(ContractError::Template { .. })
        ));

        let bad_name = method("orders", "can cel");
        assert!(matches!(
            bad_name.validate(),
            Err(ContractError::InvalidName { .. })
        ));
    }

    #[test]
    fn renders_confirmation_prompt_from_payload() {
        let policy = ConfirmationPolicy::new("t", "Cancel order {{orderId}}?", "User declined");
        let payload = json!({"orderId": "o1"});
        assert_eq!(policy.render_prompt(&payload).unwrap(), "Cancel order o1?");
        assert_eq!(policy.render_denied(&payload).unwrap(), "User declined");
    }
}
