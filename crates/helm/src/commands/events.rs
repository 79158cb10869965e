use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use eyre::Result;
use futures::StreamExt;
use helm_core::events::{self, EventCursor, EventLog};
use helm_core::protocol::sse;
use helm_core::types::RunId;
use tracing::debug;

use super::Command;
use crate::cli::EventsCommands;

const SCAN_BATCH: usize = 256;

pub struct EventsCommand {
    pub action: EventsCommands,
    pub log: Arc<dyn EventLog>,
}

#[async_trait]
impl Command for EventsCommand {
    async fn execute(&self) -> Result<()> {
        match &self.action {
            EventsCommands::Tail {
                run_id,
                last_event_id,
                follow,
            } => {
                let run_id = RunId::from(run_id.as_str());
                let from = last_event_id
                    .as_deref()
                    .map(sse::parse_last_event_id)
                    .transpose()?;
                let mut stdout = std::io::stdout();
                if *follow {
                    follow_frames(self.log.clone(), run_id, from, &mut stdout).await
                } else {
                    write_frames(self.log.as_ref(), &run_id, from, &mut stdout).await
                }
            }
        }
    }
}

/// Every event currently in the log after `from`, as SSE frames.
pub async fn write_frames<W: Write + Send>(
    log: &dyn EventLog,
    run_id: &RunId,
    from: Option<EventCursor>,
    out: &mut W,
) -> Result<()> {
    let mut cursor = from;
    loop {
        let page = log.scan(run_id, cursor, SCAN_BATCH).await?;
        for record in &page.events {
            write!(out, "{}", sse::frame(record))?;
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    out.flush()?;
    Ok(())
}

/// Catch-up then live frames until the run's terminal event.
async fn follow_frames<W: Write + Send>(
    log: Arc<dyn EventLog>,
    run_id: RunId,
    from: Option<EventCursor>,
    out: &mut W,
) -> Result<()> {
    debug!(target: "helm::sse", run_id = %run_id, ?from, "Following run events");
    let mut stream = Box::pin(events::tail(log, run_id, from));
    while let Some(record) = stream.next().await {
        let record = record?;
        write!(out, "{}", sse::frame(&record))?;
        out.flush()?;
    }
    Ok(())
}
