use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use helm_tools::ErrorKind;

pub const CONFIG_ENV: &str = "HELM_CONFIG";
pub const STORE_PATH_ENV: &str = "HELM_STORE_PATH";
pub const LOG_LEVEL_ENV: &str = "HELM_LOG_LEVEL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::Io { .. } => ErrorKind::NotFound,
            ConfigError::Parse { .. } | ConfigError::Invalid { .. } => ErrorKind::Invalid,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelmConfig {
    pub engine: EngineConfig,
    pub retry: RetryConfig,
    pub bus: BusConfig,
    pub store: StoreConfig,
    pub search: SearchConfig,
    pub federation: FederationConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent_tools: usize,
    pub drain_window_secs: u64,
    pub lease_ttl_secs: u64,
    pub max_steps: u32,
    pub history_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tools: 8,
            drain_window_secs: 30,
            lease_ttl_secs: 30,
            max_steps: 64,
            history_window: 500,
        }
    }
}

impl EngineConfig {
    pub fn drain_window(&self) -> Duration {
        Duration::from_secs(self.drain_window_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Leases are renewed three times per TTL.
    pub fn lease_renewal_interval(&self) -> Duration {
        (self.lease_ttl() / 3).max(Duration::from_millis(10))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub queue_capacity: usize,
    pub publish_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            publish_timeout_ms: 5_000,
        }
    }
}

impl BusConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub path: Option<PathBuf>,
    pub operation_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Sqlite,
            path: None,
            operation_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Configured path with `~/` expanded, defaulting to `~/.helm/helm.db`.
    pub fn resolved_path(&self) -> Result<PathBuf, ConfigError> {
        let home = || {
            dirs::home_dir()
                .ok_or_else(|| ConfigError::invalid("Could not determine home directory"))
        };
        match &self.path {
            Some(path) => match path.strip_prefix("~") {
                Ok(rest) => Ok(home()?.join(rest)),
                Err(_) => Ok(path.clone()),
            },
            None => Ok(home()?.join(".helm").join("helm.db")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_page_size: 50,
            max_page_size: 200,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub toolsets: Vec<RegistryToolsetConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryToolsetConfig {
    pub namespace: String,
    pub catalog_url: String,
    pub invoke_url: String,
    #[serde(default = "default_include")]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_include() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_ttl_secs() -> u64 {
    300
}

impl RegistryToolsetConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            dir: None,
        }
    }
}

impl HelmConfig {
    /// Default location: `<config dir>/helm/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("helm").join("config.toml"))
    }

    /// Load from `explicit`, else `$HELM_CONFIG`, else the default location.
    /// Only a missing default file falls back to defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match explicit.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup(STORE_PATH_ENV).filter(|p| !p.is_empty()) {
            self.store.path = Some(PathBuf::from(path));
        }
        if let Some(level) = lookup(LOG_LEVEL_ENV).filter(|l| !l.is_empty()) {
            self.log.level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_concurrent_tools == 0 {
            return Err(ConfigError::invalid(
                "engine.max_concurrent_tools must be at least 1",
            ));
        }
        if self.engine.max_steps == 0 {
            return Err(ConfigError::invalid("engine.max_steps must be at least 1"));
        }
        if self.bus.queue_capacity == 0 {
            return Err(ConfigError::invalid("bus.queue_capacity must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts must be at least 1"));
        }
        if self.search.default_page_size == 0
            || self.search.default_page_size > self.search.max_page_size
        {
            return Err(ConfigError::invalid(
                "search.default_page_size must be between 1 and search.max_page_size",
            ));
        }

        let mut namespaces = HashSet::new();
        for toolset in &self.federation.toolsets {
            if toolset.namespace.is_empty() {
                return Err(ConfigError::invalid("federation toolset namespace is empty"));
            }
            if !namespaces.insert(toolset.namespace.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "duplicate federation namespace: {}",
                    toolset.namespace
                )));
            }
        }
        Ok(())
    }
}
