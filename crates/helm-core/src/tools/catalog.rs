use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use jsonschema::JSONSchema;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use super::backend::ToolBackend;
use helm_tools::{
    AdapterError, ContractError, ErrorKind, ToolDefinition, ToolError, ToolSchemaCatalog,
};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Tool {tool_name} is already published by toolset {toolset}")]
    Duplicate { tool_name: String, toolset: String },

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error("Payload schema of {tool_name} does not compile: {message}")]
    Schema { tool_name: String, message: String },

    #[error("No adapter for {tool_name}: {source}")]
    Adapter {
        tool_name: String,
        #[source]
        source: AdapterError,
    },
}

impl CatalogError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CatalogError::Duplicate { .. } => ErrorKind::Conflict,
            CatalogError::Contract(_)
            | CatalogError::Schema { .. }
            | CatalogError::Adapter { .. } => ErrorKind::Invalid,
        }
    }
}

/// A published tool together with the backend that runs it and its compiled
/// payload validator.
pub struct CatalogEntry {
    pub definition: ToolDefinition,
    pub toolset: String,
    pub(crate) backend: Arc<dyn ToolBackend>,
    validator: JSONSchema,
}

impl std::fmt::Debug for CatalogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogEntry")
            .field("name", &self.definition.qualified_name())
            .field("toolset", &self.toolset)
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}

impl CatalogEntry {
    fn new(
        toolset: &str,
        definition: ToolDefinition,
        backend: Arc<dyn ToolBackend>,
    ) -> Result<Self, CatalogError> {
        definition.validate()?;
        let validator =
            JSONSchema::compile(&definition.payload_schema()).map_err(|e| CatalogError::Schema {
                tool_name: definition.qualified_name(),
                message: e.to_string(),
            })?;
        Ok(Self {
            definition,
            toolset: toolset.to_string(),
            backend,
            validator,
        })
    }

    pub fn name(&self) -> String {
        self.definition.qualified_name()
    }

    /// Check `payload` against the payload schema, joining every violation.
    pub fn validate_payload(&self, payload: &Value) -> Result<(), ToolError> {
        self.validator.validate(payload).map_err(|errors| {
            let message = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{path}: {e}")
                    }
                })
                .collect::<Vec<_>>()
                .join("; ");
            ToolError::invalid_payload(self.name(), message)
        })
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    toolsets: BTreeMap<String, Vec<Arc<CatalogEntry>>>,
    by_name: HashMap<String, Arc<CatalogEntry>>,
}

impl Snapshot {
    fn with_toolset(&self, toolset: &str, entries: Vec<Arc<CatalogEntry>>) -> Self {
        let mut toolsets = self.toolsets.clone();
        if entries.is_empty() {
            toolsets.remove(toolset);
        } else {
            toolsets.insert(toolset.to_string(), entries);
        }
        let by_name = toolsets
            .values()
            .flatten()
            .map(|entry| (entry.name(), Arc::clone(entry)))
            .collect();
        Self { toolsets, by_name }
    }
}

/// The set of tools agents may invoke, grouped into toolsets. Each publish
/// swaps the whole snapshot, so lookups never observe a partial refresh.
#[derive(Debug, Default)]
pub struct ToolCatalog {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Arc<Snapshot> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the contents of `toolset`. Every definition is checked against
    /// the tool contract first; on any error the catalog is left untouched.
    pub fn publish_toolset(
        &self,
        toolset: &str,
        definitions: Vec<ToolDefinition>,
        backend: Arc<dyn ToolBackend>,
    ) -> Result<usize, CatalogError> {
        let mut entries = Vec::with_capacity(definitions.len());
        let mut seen = HashSet::new();
        for definition in definitions {
            let entry = CatalogEntry::new(toolset, definition, Arc::clone(&backend))?;
            if !seen.insert(entry.name()) {
                return Err(CatalogError::Duplicate {
                    tool_name: entry.name(),
                    toolset: toolset.to_string(),
                });
            }
            entries.push(Arc::new(entry));
        }
        entries.sort_by_key(|entry| entry.name());

        let mut guard = match self.snapshot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for entry in &entries {
            if let Some(existing) = guard.by_name.get(&entry.name())
                && existing.toolset != toolset
            {
                return Err(CatalogError::Duplicate {
                    tool_name: entry.name(),
                    toolset: existing.toolset.clone(),
                });
            }
        }

        let count = entries.len();
        *guard = Arc::new(guard.with_toolset(toolset, entries));
        info!(
            target: "helm::catalog",
            toolset,
            tools = count,
            total = guard.by_name.len(),
            "Published toolset"
        );
        Ok(count)
    }

    pub fn remove_toolset(&self, toolset: &str) -> bool {
        let mut guard = match self.snapshot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !guard.toolsets.contains_key(toolset) {
            return false;
        }
        *guard = Arc::new(guard.with_toolset(toolset, Vec::new()));
        debug!(target: "helm::catalog", toolset, "Removed toolset");
        true
    }

    /// All definitions ordered by qualified name.
    pub fn list(&self) -> Vec<ToolDefinition> {
        let snapshot = self.current();
        let mut definitions: Vec<_> = snapshot
            .toolsets
            .values()
            .flatten()
            .map(|entry| entry.definition.clone())
            .collect();
        definitions.sort_by_key(ToolDefinition::qualified_name);
        definitions
    }

    /// Case-sensitive lookup on the qualified name.
    pub fn lookup(&self, name: &str) -> Result<Arc<CatalogEntry>, ToolError> {
        self.current()
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::unknown(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.current().by_name.contains_key(name)
    }

    pub fn toolsets(&self) -> Vec<String> {
        self.current().toolsets.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.current().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn export(&self) -> ToolSchemaCatalog {
        let definitions = self.list();
        ToolSchemaCatalog::from_definitions(&definitions)
    }

    /// The federated schema catalog document served to frontends.
    pub fn schema_bundle(&self) -> Value {
        serde_json::to_value(self.export()).unwrap_or_else(|_| serde_json::json!({"tools": []}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{InvocationContext, ToolOutput};
    use async_trait::async_trait;
    use helm_tools::{ToolId, ToolProvider};
    use serde_json::json;

    struct Null;

    #[async_trait]
    impl ToolBackend for Null {
        fn name(&self) -> &str {
            "null"
        }

        async fn invoke(
            &self,
            _definition: &ToolDefinition,
            _payload: Value,
            _ctx: &InvocationContext,
        ) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::new(json!({})))
        }
    }

    fn tool(toolset: &str, name: &str) -> ToolDefinition {
        ToolDefinition::new(
            ToolId::new(toolset, name),
            ToolProvider::MethodBacked {
                service: "svc".into(),
                method: name.into(),
            },
        )
    }

    #[test]
    fn lookup_is_case_sensitive() {
        let catalog = ToolCatalog::new();
        catalog
            .publish_toolset("local", vec![tool("todos", "list")], Arc::new(Null))
            .unwrap();
        assert!(catalog.lookup("todos.list").is_ok());
        assert!(matches!(
            catalog.lookup("Todos.List"),
            Err(ToolError::UnknownTool { .. })
        ));
    }

    #[test]
    fn republish_replaces_toolset_atomically() {
        let catalog = ToolCatalog::new();
        catalog
            .publish_toolset(
                "remote",
                vec![tool("r", "a"), tool("r", "b")],
                Arc::new(Null),
            )
            .unwrap();
        let held = catalog.lookup("r.a").unwrap();
        catalog
            .publish_toolset("remote", vec![tool("r", "c")], Arc::new(Null))
            .unwrap();
        assert_eq!(held.name(), "r.a");
        assert!(!catalog.contains("r.a"));
        assert!(catalog.contains("r.c"));
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn rejects_names_owned_by_another_toolset() {
        let catalog = ToolCatalog::new();
        catalog
            .publish_toolset("one", vec![tool("t", "x")], Arc::new(Null))
            .unwrap();
        let err = catalog
            .publish_toolset("two", vec![tool("t", "x"), tool("t", "y")], Arc::new(Null))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!catalog.contains("t.y"));
    }

    #[test]
    fn validates_payloads_against_schema() {
        let catalog = ToolCatalog::new();
        let def = tool("orders", "cancel").with_payload(helm_tools::TypedSchema::new(
            "CancelPayload",
            json!({
                "type": "object",
                "properties": {"orderId": {"type": "string"}},
                "required": ["orderId"]
            }),
        ));
        catalog
            .publish_toolset("local", vec![def], Arc::new(Null))
            .unwrap();
        let entry = catalog.lookup("orders.cancel").unwrap();
        assert!(entry.validate_payload(&json!({"orderId": "o1"})).is_ok());
        let err = entry.validate_payload(&json!({"orderId": 7})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidPayload { .. }));
    }

    #[test]
    fn bundle_lists_tools_by_id() {
        let catalog = ToolCatalog::new();
        catalog
            .publish_toolset(
                "local",
                vec![tool("b", "z"), tool("a", "y")],
                Arc::new(Null),
            )
            .unwrap();
        let bundle = catalog.schema_bundle();
        assert_eq!(bundle["tools"][0]["id"], json!("a.y"));
        assert_eq!(bundle["tools"][1]["id"], json!("b.z"));
    }
}
