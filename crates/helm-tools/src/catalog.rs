use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::definition::{ConfirmationPolicy, ToolDefinition, ToolId, ToolProvider, TypedSchema};

/// One entry of `specs/tool_schemas.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchemaEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub toolset: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<ConfirmationPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<TypedSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TypedSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar: Option<TypedSchema>,
}

impl From<&ToolDefinition> for ToolSchemaEntry {
    fn from(def: &ToolDefinition) -> Self {
        Self {
            id: def.id.to_string(),
            service: def.service.clone(),
            toolset: def.id.toolset.clone(),
            title: def.title.clone(),
            description: def.description.clone(),
            tags: def.tags.clone(),
            confirmation: def.confirmation.clone(),
            payload: def.payload.clone(),
            result: def.result.clone(),
            sidecar: def.sidecar.clone(),
        }
    }
}

impl ToolSchemaEntry {
    /// Rebuild a definition from a catalog entry. Returns `None` when the id
    /// is not of the form `<toolset>.<tool>`.
    pub fn to_definition(&self, provider: ToolProvider) -> Option<ToolDefinition> {
        let id = ToolId::parse(&self.id)?;
        let mut def = ToolDefinition::new(id, provider)
            .with_title(self.title.clone())
            .with_description(self.description.clone())
            .with_tags(self.tags.clone());
        def.service.clone_from(&self.service);
        def.payload.clone_from(&self.payload);
        def.result.clone_from(&self.result);
        def.sidecar.clone_from(&self.sidecar);
        def.confirmation.clone_from(&self.confirmation);
        def.bounded = self
            .result
            .as_ref()
            .and_then(|r| r.schema.get("properties"))
            .is_some_and(|p| p.get(crate::bounds::BOUNDS_FIELD).is_some());
        Some(def)
    }
}

/// The federated tool schema document consumed by frontends and by
/// registry-backed toolsets of other agents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSchemaCatalog {
    pub tools: Vec<ToolSchemaEntry>,
}

impl ToolSchemaCatalog {
    /// Build the document with entries in stable `id` order.
    pub fn from_definitions<'a, I>(definitions: I) -> Self
    where
        I: IntoIterator<Item = &'a ToolDefinition>,
    {
        let mut tools: Vec<ToolSchemaEntry> =
            definitions.into_iter().map(ToolSchemaEntry::from).collect();
        tools.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.service.cmp(&b.service)));
        Self { tools }
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Pretty JSON, always terminated by a newline.
    pub fn to_json_string(&self) -> serde_json::Result<String> {
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        Ok(text)
    }

    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let text = self.to_json_string().map_err(io::Error::other)?;
        std::fs::write(path, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(toolset: &str, name: &str) -> ToolDefinition {
        ToolDefinition::new(
            ToolId::new(toolset, name),
            ToolProvider::MethodBacked {
                service: "svc".into(),
                method: name.into(),
            },
        )
        .with_service("svc")
    }

    #[test]
    fn entries_are_sorted_by_id_and_file_ends_with_newline() {
        let defs = [def("todos", "list"), def("orders", "cancel"), def("orders", "a")];
        let catalog = ToolSchemaCatalog::from_definitions(&defs);
        let ids: Vec<_> = catalog.tools.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["orders.a", "orders.cancel", "todos.list"]);

        let text = catalog.to_json_string().unwrap();
        assert!(text.ends_with("}\n"));
        assert_eq!(ToolSchemaCatalog::from_json(&text).unwrap(), catalog);
    }

    #[test]
    fn optional_sections_are_omitted() {
        let catalog = ToolSchemaCatalog::from_definitions(&[def("todos", "list")]);
        let value = serde_json::to_value(&catalog).unwrap();
        let entry = &value["tools"][0];
        assert_eq!(entry["id"], json!("todos.list"));
        assert_eq!(entry["toolset"], json!("todos"));
        assert!(entry.get("confirmation").is_none());
        assert!(entry.get("payload").is_none());
    }

    #[test]
    fn write_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("specs").join("tool_schemas.json");
        ToolSchemaCatalog::from_definitions(&[def("todos", "list")])
            .write_to(&path)
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn entry_round_trips_to_definition() {
        let original = def("orders", "cancel").with_confirmation(ConfirmationPolicy::new(
            "Cancel",
            "Cancel {{orderId}}?",
            "User declined",
        ));
        let entry = ToolSchemaEntry::from(&original);
        let rebuilt = entry.to_definition(original.provider.clone()).unwrap();
        assert_eq!(rebuilt.qualified_name(), "svc.orders.cancel");
        assert_eq!(rebuilt.confirmation, original.confirmation);
    }
}
