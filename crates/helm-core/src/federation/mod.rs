//! Registry-backed toolsets: remote catalogs filtered, validated and
//! published into the local [`ToolCatalog`], then kept fresh on a TTL.

mod source;

pub use source::{HttpRegistrySource, RegistrySource};

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use globset::{Glob, GlobSet, GlobSetBuilder};
use jsonschema::JSONSchema;
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{FederationConfig, RegistryToolsetConfig};
use crate::tools::{CatalogError, RegistryBackend, ToolBackend, ToolCatalog};
use helm_tools::{ErrorKind, ToolDefinition, ToolProvider, ToolSchemaCatalog};

#[derive(Debug, Error)]
pub enum FederationError {
    #[error("Failed to fetch registry catalog from {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("Registry catalog from {url} is malformed: {message}")]
    Parse { url: String, message: String },

    #[error("Invalid pattern '{pattern}' for toolset {namespace}: {message}")]
    Pattern {
        namespace: String,
        pattern: String,
        message: String,
    },

    #[error("Failed to publish toolset {namespace}: {source}")]
    Publish {
        namespace: String,
        #[source]
        source: CatalogError,
    },
}

impl FederationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FederationError::Fetch { .. } => ErrorKind::Transient,
            FederationError::Parse { .. } => ErrorKind::Permanent,
            FederationError::Pattern { .. } => ErrorKind::Invalid,
            FederationError::Publish { source, .. } => source.kind(),
        }
    }
}

/// Include/exclude globs over remote tool ids. An empty include list admits
/// every id; exclusion is applied after inclusion.
#[derive(Debug, Clone)]
pub struct ToolsetFilter {
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl ToolsetFilter {
    pub fn new(
        namespace: &str,
        include: &[String],
        exclude: &[String],
    ) -> Result<Self, FederationError> {
        let include = if include.is_empty() {
            None
        } else {
            Some(build_globset(namespace, include)?)
        };
        Ok(Self {
            include,
            exclude: build_globset(namespace, exclude)?,
        })
    }

    pub fn allows(&self, tool_id: &str) -> bool {
        self.include
            .as_ref()
            .is_none_or(|set| set.is_match(tool_id))
            && !self.exclude.is_match(tool_id)
    }
}

fn build_globset(namespace: &str, patterns: &[String]) -> Result<GlobSet, FederationError> {
    let invalid = |pattern: &str, message: String| FederationError::Pattern {
        namespace: namespace.to_string(),
        pattern: pattern.to_string(),
        message,
    };
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| invalid(pattern, e.to_string()))?;
        builder.add(glob);
    }
    builder.build().map_err(|e| invalid("", e.to_string()))
}

/// One remote catalog mirrored into a namespace of the local catalog.
pub struct RegistryToolset {
    config: RegistryToolsetConfig,
    filter: ToolsetFilter,
    source: Arc<dyn RegistrySource>,
    backend: Arc<dyn ToolBackend>,
    last_success: Mutex<Option<Instant>>,
}

impl RegistryToolset {
    pub fn new(
        config: RegistryToolsetConfig,
        source: Arc<dyn RegistrySource>,
        backend: Arc<dyn ToolBackend>,
    ) -> Result<Self, FederationError> {
        let filter = ToolsetFilter::new(&config.namespace, &config.include, &config.exclude)?;
        Ok(Self {
            config,
            filter,
            source,
            backend,
            last_success: Mutex::new(None),
        })
    }

    pub fn from_config(config: RegistryToolsetConfig) -> Result<Self, FederationError> {
        let source = Arc::new(HttpRegistrySource::new(config.catalog_url.clone()));
        let backend = Arc::new(RegistryBackend::new(
            config.namespace.clone(),
            config.invoke_url.clone(),
        ));
        Self::new(config, source, backend)
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// The entries of `remote` this toolset admits, as local definitions.
    /// Entries that fail the tool contract are skipped with a warning.
    pub fn resolve(&self, remote: &ToolSchemaCatalog) -> Vec<ToolDefinition> {
        let namespace = self.namespace();
        let mut seen = HashSet::new();
        let mut definitions = Vec::new();
        for entry in &remote.tools {
            if !self.filter.allows(&entry.id) {
                debug!(target: "helm::federation", namespace, tool = %entry.id, "Filtered out");
                continue;
            }
            let provider = ToolProvider::RegistryBacked {
                namespace: namespace.to_string(),
                remote_id: entry.id.clone(),
            };
            let Some(mut definition) = entry.to_definition(provider) else {
                warn!(
                    target: "helm::federation",
                    namespace,
                    tool = %entry.id,
                    "Skipping registry entry with malformed id"
                );
                continue;
            };
            definition.service = Some(namespace.to_string());

            if let Err(e) = definition.validate() {
                warn!(
                    target: "helm::federation",
                    namespace,
                    tool = %entry.id,
                    error = %e,
                    "Skipping registry entry that breaks the tool contract"
                );
                continue;
            }
            if let Err(e) = JSONSchema::compile(&definition.payload_schema()) {
                warn!(
                    target: "helm::federation",
                    namespace,
                    tool = %entry.id,
                    error = %e,
                    "Skipping registry entry with an invalid payload schema"
                );
                continue;
            }
            if !seen.insert(definition.qualified_name()) {
                warn!(
                    target: "helm::federation",
                    namespace,
                    tool = %entry.id,
                    "Skipping duplicate registry entry"
                );
                continue;
            }
            definitions.push(definition);
        }
        definitions
    }

    /// Fetch, resolve and publish. On failure the previously published set
    /// stays in the catalog untouched.
    pub async fn refresh(&self, catalog: &ToolCatalog) -> Result<usize, FederationError> {
        let result = self.fetch_and_publish(catalog).await;
        let mut last_success = match self.last_success.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match &result {
            Ok(count) => {
                *last_success = Some(Instant::now());
                info!(
                    target: "helm::federation",
                    namespace = self.namespace(),
                    tools = count,
                    "Registry toolset refreshed"
                );
            }
            Err(e) => match *last_success {
                Some(at) => warn!(
                    target: "helm::federation",
                    namespace = self.namespace(),
                    source = self.source.location(),
                    age_secs = at.elapsed().as_secs(),
                    error = %e,
                    "Registry refresh failed, stale read of the previous toolset"
                ),
                None => warn!(
                    target: "helm::federation",
                    namespace = self.namespace(),
                    source = self.source.location(),
                    error = %e,
                    "Registry refresh failed, no toolset published yet"
                ),
            },
        }
        result
    }

    async fn fetch_and_publish(&self, catalog: &ToolCatalog) -> Result<usize, FederationError> {
        let remote = self.source.fetch().await?;
        let definitions = self.resolve(&remote);
        catalog
            .publish_toolset(self.namespace(), definitions, Arc::clone(&self.backend))
            .map_err(|source| FederationError::Publish {
                namespace: self.namespace().to_string(),
                source,
            })
    }

    async fn refresh_loop(self: Arc<Self>, catalog: Arc<ToolCatalog>, cancel: CancellationToken) {
        let ttl = self.config.ttl();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(ttl) => {
                    let _ = self.refresh(&catalog).await;
                }
            }
        }
        debug!(target: "helm::federation", namespace = self.namespace(), "Refresh loop stopped");
    }
}

/// All registry-backed toolsets of one process.
pub struct Federation {
    catalog: Arc<ToolCatalog>,
    toolsets: Vec<Arc<RegistryToolset>>,
}

impl Federation {
    pub fn new(catalog: Arc<ToolCatalog>) -> Self {
        Self {
            catalog,
            toolsets: Vec::new(),
        }
    }

    pub fn from_config(
        catalog: Arc<ToolCatalog>,
        config: &FederationConfig,
    ) -> Result<Self, FederationError> {
        let mut federation = Self::new(catalog);
        for toolset in &config.toolsets {
            federation = federation.with_toolset(RegistryToolset::from_config(toolset.clone())?);
        }
        Ok(federation)
    }

    pub fn with_toolset(mut self, toolset: RegistryToolset) -> Self {
        self.toolsets.push(Arc::new(toolset));
        self
    }

    pub fn len(&self) -> usize {
        self.toolsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.toolsets.is_empty()
    }

    /// Refresh every toolset once; returns how many succeeded. Failures are
    /// logged and leave earlier sets in place.
    pub async fn refresh_all(&self) -> usize {
        let mut refreshed = 0;
        for toolset in &self.toolsets {
            if toolset.refresh(&self.catalog).await.is_ok() {
                refreshed += 1;
            }
        }
        refreshed
    }

    /// Initial refresh, then one TTL loop per toolset until `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let refreshed = self.refresh_all().await;
        info!(
            target: "helm::federation",
            toolsets = self.toolsets.len(),
            refreshed,
            "Federation started"
        );
        let mut loops = JoinSet::new();
        for toolset in &self.toolsets {
            loops.spawn(Arc::clone(toolset).refresh_loop(self.catalog.clone(), cancel.clone()));
        }
        tokio::spawn(async move {
            while loops.join_next().await.is_some() {}
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::EchoBackend;
    use async_trait::async_trait;
    use helm_tools::{ToolSchemaEntry, TypedSchema};
    use serde_json::json;
    use std::collections::VecDeque;

    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<ToolSchemaCatalog, FederationError>>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<ToolSchemaCatalog, FederationError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
            })
        }
    }

    #[async_trait]
    impl RegistrySource for ScriptedSource {
        fn location(&self) -> &str {
            "scripted"
        }

        async fn fetch(&self) -> Result<ToolSchemaCatalog, FederationError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(FederationError::Fetch {
                        url: "scripted".into(),
                        message: "exhausted".into(),
                    })
                })
        }
    }

    fn entry(id: &str) -> ToolSchemaEntry {
        ToolSchemaEntry {
            id: id.to_string(),
            service: Some("upstream".into()),
            toolset: id.split('.').next().unwrap_or_default().to_string(),
            title: id.to_string(),
            description: String::new(),
            tags: Vec::new(),
            confirmation: None,
            payload: Some(TypedSchema::new(
                "Input",
                json!({"type": "object", "properties": {}}),
            )),
            result: None,
            sidecar: None,
        }
    }

    fn remote(ids: &[&str]) -> ToolSchemaCatalog {
        ToolSchemaCatalog {
            tools: ids.iter().map(|id| entry(id)).collect(),
        }
    }

    fn config(include: &[&str], exclude: &[&str]) -> RegistryToolsetConfig {
        RegistryToolsetConfig {
            namespace: "registry".into(),
            catalog_url: "http://registry.invalid/specs/tool_schemas.json".into(),
            invoke_url: "http://registry.invalid/rpc".into(),
            include: include.iter().map(|s| s.to_string()).collect(),
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
            ttl_secs: 300,
        }
    }

    #[test]
    fn include_then_exclude() {
        let filter = ToolsetFilter::new(
            "registry",
            &["todos.*".to_string()],
            &["todos.delete".to_string()],
        )
        .unwrap();
        assert!(filter.allows("todos.list"));
        assert!(!filter.allows("todos.delete"));
        assert!(!filter.allows("orders.cancel"));

        let open = ToolsetFilter::new("registry", &[], &[]).unwrap();
        assert!(open.allows("anything.at_all"));
    }

    #[test]
    fn bad_patterns_are_rejected() {
        let err = ToolsetFilter::new("registry", &["todos.[".to_string()], &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn refresh_publishes_under_namespace() {
        let catalog = ToolCatalog::new();
        let source = ScriptedSource::new(vec![Ok(remote(&[
            "todos.list",
            "todos.delete",
            "malformed",
        ]))]);
        let toolset = RegistryToolset::new(
            config(&["*"], &["todos.delete"]),
            source,
            Arc::new(EchoBackend::default()),
        )
        .unwrap();

        assert_eq!(toolset.refresh(&catalog).await.unwrap(), 1);
        let entry = catalog.lookup("registry.todos.list").unwrap();
        assert_eq!(
            entry.definition.provider,
            ToolProvider::RegistryBacked {
                namespace: "registry".into(),
                remote_id: "todos.list".into(),
            }
        );
        assert!(!catalog.contains("registry.todos.delete"));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_set() {
        let catalog = ToolCatalog::new();
        let source = ScriptedSource::new(vec![
            Ok(remote(&["todos.list", "todos.add"])),
            Err(FederationError::Fetch {
                url: "scripted".into(),
                message: "connection refused".into(),
            }),
        ]);
        let toolset = RegistryToolset::new(
            config(&["*"], &[]),
            source,
            Arc::new(EchoBackend::default()),
        )
        .unwrap();

        toolset.refresh(&catalog).await.unwrap();
        let err = toolset.refresh(&catalog).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(catalog.contains("registry.todos.list"));
        assert!(catalog.contains("registry.todos.add"));
    }

    #[tokio::test]
    async fn refresh_all_counts_successes() {
        let catalog = Arc::new(ToolCatalog::new());
        let federation = Federation::new(catalog.clone()).with_toolset(
            RegistryToolset::new(
                config(&["*"], &[]),
                ScriptedSource::new(vec![Ok(remote(&["todos.list"]))]),
                Arc::new(EchoBackend::default()),
            )
            .unwrap(),
        );
        assert_eq!(federation.refresh_all().await, 1);
        assert_eq!(federation.refresh_all().await, 0);
        assert_eq!(catalog.len(), 1);
    }
}
