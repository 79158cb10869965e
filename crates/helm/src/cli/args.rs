use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use helm_core::search::{SessionSortField, SortOrder};
use helm_core::session::RunStatus;
use helm_tools::ResultCode;

#[derive(Parser, Debug)]
#[command(version, about = "Operate a helm agent runtime", long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, env = "HELM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level or filter directive, e.g. `debug` or `helm::engine=trace`
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Inspect and export the federated tool catalog
    Tools {
        #[command(subcommand)]
        action: ToolsCommands,
    },
    /// Search sessions and tool failures
    Search {
        #[command(subcommand)]
        action: SearchCommands,
    },
    /// Read a run's event log
    Events {
        #[command(subcommand)]
        action: EventsCommands,
    },
    /// Inspect runs
    Runs {
        #[command(subcommand)]
        action: RunsCommands,
    },
    /// Manage sessions
    Sessions {
        #[command(subcommand)]
        action: SessionsCommands,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ToolsCommands {
    /// Write the merged tool schema document
    Export {
        #[arg(long, default_value = "specs/tool_schemas.json")]
        out: PathBuf,
        /// Additional schema documents merged into the export
        #[arg(long = "catalog")]
        catalogs: Vec<PathBuf>,
    },
    /// List tools published by the configured toolsets
    List {
        #[arg(long = "catalog")]
        catalogs: Vec<PathBuf>,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum SortField {
    CreatedAt,
    LastEventAt,
}

impl From<SortField> for SessionSortField {
    fn from(field: SortField) -> Self {
        match field {
            SortField::CreatedAt => SessionSortField::CreatedAt,
            SortField::LastEventAt => SessionSortField::LastEventAt,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum SearchCommands {
    Sessions {
        #[arg(long = "org")]
        orgs: Vec<String>,
        #[arg(long = "agent")]
        agents: Vec<String>,
        #[arg(long = "principal")]
        principals: Vec<String>,
        #[arg(long)]
        include_deleted: bool,
        #[arg(long, value_enum, default_value_t = SortField::CreatedAt)]
        sort: SortField,
        /// Oldest first
        #[arg(long)]
        asc: bool,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        cursor: Option<String>,
    },
    Failures {
        #[arg(long = "tool")]
        tools: Vec<String>,
        #[arg(long = "code")]
        codes: Vec<ResultCode>,
        #[arg(long = "org")]
        orgs: Vec<String>,
        #[arg(long = "agent")]
        agents: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        cursor: Option<String>,
    },
}

impl SearchCommands {
    pub fn sort_order(asc: bool) -> SortOrder {
        if asc { SortOrder::Asc } else { SortOrder::Desc }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum EventsCommands {
    /// Print a run's events as SSE frames
    Tail {
        run_id: String,
        /// Resume after this sequence number
        #[arg(long)]
        last_event_id: Option<String>,
        /// Keep streaming until the run's terminal event
        #[arg(long, short)]
        follow: bool,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum RunsCommands {
    List {
        #[arg(long)]
        session: Option<String>,
        #[arg(long = "status")]
        statuses: Vec<RunStatus>,
    },
    Show {
        run_id: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    Show { session_id: String },
    End { session_id: String },
    /// Soft delete; the session stays loadable
    Delete { session_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_failure_search() {
        let cli = Cli::try_parse_from([
            "helm",
            "--log-level",
            "debug",
            "search",
            "failures",
            "--tool",
            "orders.cancel",
            "--code",
            "denied",
            "--limit",
            "5",
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(
            cli.command,
            Commands::Search {
                action: SearchCommands::Failures { ref tools, ref codes, limit: Some(5), .. },
            } if tools == &["orders.cancel"] && codes == &[ResultCode::Denied]
        ));
    }

    #[test]
    fn parses_run_status_filters() {
        let cli = Cli::try_parse_from([
            "helm", "runs", "list", "--status", "running", "--status", "paused",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Runs {
                action: RunsCommands::List { session: None, ref statuses },
            } if statuses == &[RunStatus::Running, RunStatus::Paused]
        ));
    }

    #[test]
    fn rejects_unknown_status() {
        assert!(Cli::try_parse_from(["helm", "runs", "list", "--status", "sleeping"]).is_err());
    }

    #[test]
    fn export_defaults_to_specs_path() {
        let cli = Cli::try_parse_from(["helm", "tools", "export"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Tools {
                action: ToolsCommands::Export { ref out, ref catalogs },
            } if out == &PathBuf::from("specs/tool_schemas.json") && catalogs.is_empty()
        ));
    }
}
