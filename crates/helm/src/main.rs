use clap::Parser;
use eyre::Result;
use tracing::debug;

use helm::cli::{Cli, Commands, config::load_config};
use helm::commands::{
    Command, events::EventsCommand, runs::RunsCommand, search::SearchCommand,
    sessions::SessionsCommand, tools::ToolsCommand,
};
use helm::stores::open_stores;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.log_level.as_deref(), cli.json_logs)?;
    let _guard = helm::logging::init_tracing(&config.log, cli.log_level.is_some())?;
    debug!(target: "helm::cli", command = ?cli.command, "Starting");

    match cli.command {
        Commands::Tools { action } => {
            ToolsCommand {
                action,
                federation: config.federation.clone(),
            }
            .execute()
            .await
        }
        Commands::Search { action } => {
            let stores = open_stores(&config.store).await?;
            SearchCommand {
                action,
                index: stores.index,
                config: config.search.clone(),
            }
            .execute()
            .await
        }
        Commands::Events { action } => {
            let stores = open_stores(&config.store).await?;
            EventsCommand {
                action,
                log: stores.log,
            }
            .execute()
            .await
        }
        Commands::Runs { action } => {
            let stores = open_stores(&config.store).await?;
            RunsCommand {
                action,
                store: stores.sessions,
            }
            .execute()
            .await
        }
        Commands::Sessions { action } => {
            let stores = open_stores(&config.store).await?;
            SessionsCommand {
                action,
                store: stores.sessions,
            }
            .execute()
            .await
        }
    }
}
