use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use comfy_table::{Cell, Color, Table};
use eyre::{Result, WrapErr, eyre};
use helm_core::config::FederationConfig;
use helm_core::federation::Federation;
use helm_core::tools::ToolCatalog;
use helm_tools::{ToolSchemaCatalog, ToolSchemaEntry};
use tracing::{info, warn};

use super::Command;
use crate::cli::ToolsCommands;

pub struct ToolsCommand {
    pub action: ToolsCommands,
    pub federation: FederationConfig,
}

#[async_trait]
impl Command for ToolsCommand {
    async fn execute(&self) -> Result<()> {
        match &self.action {
            ToolsCommands::Export { out, catalogs } => {
                let document = self.collect(catalogs).await?;
                document
                    .write_to(out)
                    .wrap_err_with(|| format!("Failed to write {}", out.display()))?;
                let mut stdout = std::io::stdout();
                writeln!(
                    stdout,
                    "Wrote {} tools to {}",
                    document.tools.len(),
                    out.display()
                )?;
                Ok(())
            }
            ToolsCommands::List { catalogs } => {
                let document = self.collect(catalogs).await?;
                let mut stdout = std::io::stdout();
                if document.tools.is_empty() {
                    writeln!(stdout, "No tools found.")?;
                    return Ok(());
                }
                writeln!(stdout, "{}", tool_table(&document))?;
                Ok(())
            }
        }
    }
}

impl ToolsCommand {
    /// Refresh every configured toolset once, then merge local schema
    /// documents over the result. Local entries replace federated ones with
    /// the same id.
    async fn collect(&self, catalogs: &[PathBuf]) -> Result<ToolSchemaCatalog> {
        let catalog = Arc::new(ToolCatalog::new());
        let federation = Federation::from_config(catalog.clone(), &self.federation)?;
        if !federation.is_empty() {
            let refreshed = federation.refresh_all().await;
            if refreshed < federation.len() {
                warn!(
                    target: "helm::catalog",
                    refreshed,
                    configured = federation.len(),
                    "Some toolsets could not be fetched"
                );
            }
        }

        let mut documents = vec![catalog.export()];
        for path in catalogs {
            documents.push(read_catalog(path)?);
        }
        let merged = merge(documents);
        info!(target: "helm::catalog", tools = merged.tools.len(), "Collected tool schemas");
        Ok(merged)
    }
}

fn read_catalog(path: &Path) -> Result<ToolSchemaCatalog> {
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
    ToolSchemaCatalog::from_json(&text)
        .map_err(|e| eyre!("Invalid tool schema document {}: {}", path.display(), e))
}

/// Later documents win on `(id, service)`; output stays in id order.
pub fn merge(documents: Vec<ToolSchemaCatalog>) -> ToolSchemaCatalog {
    let mut entries: BTreeMap<(String, Option<String>), ToolSchemaEntry> = BTreeMap::new();
    for document in documents {
        for entry in document.tools {
            entries.insert((entry.id.clone(), entry.service.clone()), entry);
        }
    }
    ToolSchemaCatalog {
        tools: entries.into_values().collect(),
    }
}

fn tool_table(document: &ToolSchemaCatalog) -> Table {
    let mut table = Table::new();
    table.set_header(vec![
        Cell::new("Tool").fg(Color::Green),
        Cell::new("Toolset").fg(Color::Green),
        Cell::new("Title").fg(Color::Green),
        Cell::new("Confirmation").fg(Color::Green),
    ]);
    for entry in &document.tools {
        let confirmation = match &entry.confirmation {
            Some(_) => Cell::new("required").fg(Color::DarkYellow),
            None => Cell::new(""),
        };
        table.add_row(vec![
            Cell::new(&entry.id),
            Cell::new(&entry.toolset),
            Cell::new(&entry.title),
            confirmation,
        ]);
    }
    table
}
