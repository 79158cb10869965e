use std::sync::Arc;

use eyre::{Result, WrapErr};
use helm_core::config::{StoreConfig, StoreKind};
use helm_core::events::EventLog;
use helm_core::search::SearchIndex;
use helm_core::session::{InMemoryStore, SessionStore, SqliteStore};
use tracing::{debug, warn};

/// The three store roles a backend plays.
#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub log: Arc<dyn EventLog>,
    pub index: Arc<dyn SearchIndex>,
}

impl Stores {
    fn from_backend<S>(store: Arc<S>) -> Self
    where
        S: SessionStore + EventLog + SearchIndex + 'static,
    {
        Self {
            sessions: store.clone(),
            log: store.clone(),
            index: store,
        }
    }
}

pub async fn open_stores(config: &StoreConfig) -> Result<Stores> {
    match config.kind {
        StoreKind::Sqlite => {
            let path = config.resolved_path()?;
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).wrap_err_with(|| {
                    format!("Failed to create store directory {}", parent.display())
                })?;
            }
            debug!(target: "helm::store", path = %path.display(), "Opening SQLite store");
            let store = SqliteStore::open(&path, config.operation_timeout())
                .await
                .wrap_err_with(|| format!("Failed to open store at {}", path.display()))?;
            Ok(Stores::from_backend(Arc::new(store)))
        }
        StoreKind::Memory => {
            warn!(target: "helm::store", "Using an in-memory store; nothing outlives this process");
            Ok(Stores::from_backend(Arc::new(InMemoryStore::new())))
        }
    }
}
