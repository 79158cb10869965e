use thiserror::Error;

use crate::api::ApiError;
use crate::bus::BusError;
use crate::config::ConfigError;
use crate::events::EventLogError;
use crate::federation::FederationError;
use crate::runtime::EngineError;
use crate::search::SearchError;
use crate::session::StoreError;
use crate::tools::CatalogError;
use helm_tools::{ErrorKind, ToolError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    EventLog(#[from] EventLogError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error(transparent)]
    Federation(#[from] FederationError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Store(e) => e.kind(),
            Error::EventLog(e) => e.kind(),
            Error::Tool(e) => e.kind(),
            Error::Catalog(e) => e.kind(),
            Error::Api(e) => e.kind(),
            Error::Engine(e) => e.kind(),
            Error::Bus(e) => e.kind(),
            Error::Search(e) => e.kind(),
            Error::Federation(e) => e.kind(),
            Error::Config(e) => e.kind(),
            Error::Io(_) => ErrorKind::Transient,
        }
    }
}
