use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use eyre::Result;
use helm_core::session::SessionStore;
use helm_core::types::SessionId;
use tracing::info;

use super::{Command, format_time};
use crate::cli::SessionsCommands;

pub struct SessionsCommand {
    pub action: SessionsCommands,
    pub store: Arc<dyn SessionStore>,
}

#[async_trait]
impl Command for SessionsCommand {
    async fn execute(&self) -> Result<()> {
        let mut stdout = std::io::stdout();
        match &self.action {
            SessionsCommands::Show { session_id } => {
                let session = self.store.load_session(&SessionId::from(session_id.as_str())).await?;
                writeln!(stdout, "{}", serde_json::to_string_pretty(&session)?)?;
            }
            SessionsCommands::End { session_id } => {
                let session = self
                    .store
                    .end_session(&SessionId::from(session_id.as_str()), Utc::now())
                    .await?;
                let ended = session.ended_at.map(format_time).unwrap_or_default();
                writeln!(stdout, "Session {} ended at {}", session.id, ended)?;
            }
            SessionsCommands::Delete { session_id } => {
                let session = self
                    .store
                    .delete_session(&SessionId::from(session_id.as_str()), Utc::now())
                    .await?;
                info!(target: "helm::store", session_id = %session.id, "Session deleted");
                writeln!(stdout, "Session {} deleted", session.id)?;
            }
        }
        Ok(())
    }
}
