use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use comfy_table::{Cell, Color, Table};
use eyre::Result;
use helm_core::session::{RunMeta, RunStatus, SessionStore};
use helm_core::types::{RunId, SessionId};

use super::{Command, format_time};
use crate::cli::RunsCommands;

pub struct RunsCommand {
    pub action: RunsCommands,
    pub store: Arc<dyn SessionStore>,
}

#[async_trait]
impl Command for RunsCommand {
    async fn execute(&self) -> Result<()> {
        let mut stdout = std::io::stdout();
        match &self.action {
            RunsCommands::List { session, statuses } => {
                let runs = self.list(session.as_deref(), statuses).await?;
                if runs.is_empty() {
                    writeln!(stdout, "No runs found.")?;
                    return Ok(());
                }
                writeln!(stdout, "{}", run_table(&runs))?;
            }
            RunsCommands::Show { run_id } => {
                let meta = self.store.load_run(&RunId::from(run_id.as_str())).await?;
                writeln!(stdout, "{}", serde_json::to_string_pretty(&meta)?)?;
            }
        }
        Ok(())
    }
}

impl RunsCommand {
    /// Without a session, lists runs in the given statuses, or the
    /// non-terminal ones when none are given.
    async fn list(&self, session: Option<&str>, statuses: &[RunStatus]) -> Result<Vec<RunMeta>> {
        let statuses = (!statuses.is_empty()).then_some(statuses);
        let runs = match session {
            Some(session) => {
                self.store
                    .list_runs_by_session(&SessionId::from(session), statuses)
                    .await?
            }
            None => {
                let active = [RunStatus::Pending, RunStatus::Running, RunStatus::Paused];
                self.store
                    .list_runs_by_status(statuses.unwrap_or(&active))
                    .await?
            }
        };
        Ok(runs)
    }
}

fn status_cell(status: RunStatus) -> Cell {
    let color = match status {
        RunStatus::Completed => Color::Green,
        RunStatus::Failed => Color::Red,
        RunStatus::Canceled => Color::DarkGrey,
        RunStatus::Paused => Color::DarkYellow,
        RunStatus::Pending | RunStatus::Running => Color::Cyan,
    };
    Cell::new(status).fg(color)
}

fn run_table(runs: &[RunMeta]) -> Table {
    let mut table = Table::new();
    table.set_header(vec![
        Cell::new("Run").fg(Color::Green),
        Cell::new("Session").fg(Color::Green),
        Cell::new("Agent").fg(Color::Green),
        Cell::new("Status").fg(Color::Green),
        Cell::new("Started").fg(Color::Green),
        Cell::new("Updated").fg(Color::Green),
    ]);
    for run in runs {
        table.add_row(vec![
            Cell::new(&run.run_id),
            Cell::new(&run.session_id),
            Cell::new(&run.agent_id),
            status_cell(run.status),
            Cell::new(format_time(run.started_at)),
            Cell::new(format_time(run.updated_at)),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use helm_core::session::{InMemoryStore, SessionAttributes};
    use helm_core::types::AgentId;

    #[tokio::test]
    async fn lists_active_runs_by_default() {
        let store = Arc::new(InMemoryStore::new());
        let session = SessionId::from("s1");
        store
            .create_session(&session, Utc::now(), SessionAttributes::default())
            .await
            .unwrap();
        for (run, status) in [("r1", RunStatus::Completed), ("r2", RunStatus::Paused)] {
            let now = Utc::now();
            let meta = RunMeta::new(RunId::from(run), AgentId::from("a"), session.clone(), now)
                .with_status(status, now);
            store.upsert_run(&meta).await.unwrap();
        }

        let command = RunsCommand {
            action: RunsCommands::List {
                session: None,
                statuses: Vec::new(),
            },
            store: store.clone(),
        };
        let active = command.list(None, &[]).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].run_id.as_str(), "r2");

        let all = command.list(Some("s1"), &[]).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(run_table(&all).row_iter().count(), 2);
    }
}
