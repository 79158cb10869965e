use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use eyre::Result;
use helm_core::config::SearchConfig;
use helm_core::search::{FailureFilter, SearchIndex, SearchService, SessionFilter, SessionSort};
use serde::Serialize;

use super::Command;
use crate::cli::SearchCommands;

pub struct SearchCommand {
    pub action: SearchCommands,
    pub index: Arc<dyn SearchIndex>,
    pub config: SearchConfig,
}

#[async_trait]
impl Command for SearchCommand {
    async fn execute(&self) -> Result<()> {
        let service = SearchService::new(self.index.clone(), self.config.clone());
        match &self.action {
            SearchCommands::Sessions {
                orgs,
                agents,
                principals,
                include_deleted,
                sort,
                asc,
                limit,
                cursor,
            } => {
                let filter = SessionFilter {
                    org_ids: orgs.clone(),
                    agent_ids: agents.clone(),
                    principal_ids: principals.clone(),
                    include_deleted: *include_deleted,
                    ..SessionFilter::default()
                };
                let sort = SessionSort::new((*sort).into(), SearchCommands::sort_order(*asc));
                let page = service
                    .search_sessions(&filter, sort, cursor.as_deref(), *limit)
                    .await?;
                print_json(&page)
            }
            SearchCommands::Failures {
                tools,
                codes,
                orgs,
                agents,
                limit,
                cursor,
            } => {
                let filter = FailureFilter {
                    org_ids: orgs.clone(),
                    agent_ids: agents.clone(),
                    tool_names: tools.clone(),
                    result_codes: codes.clone(),
                    ..FailureFilter::default()
                };
                let page = service
                    .search_failures(&filter, cursor.as_deref(), *limit)
                    .await?;
                print_json(&page)
            }
        }
    }
}

/// Pages print as pretty JSON so `nextCursor` can be fed back with
/// `--cursor`.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{}", serde_json::to_string_pretty(value)?)?;
    Ok(())
}
