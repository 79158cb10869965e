use async_trait::async_trait;
use tracing::debug;

use super::FederationError;
use helm_tools::ToolSchemaCatalog;

/// Where a registry-backed toolset reads its remote catalog from.
#[async_trait]
pub trait RegistrySource: Send + Sync {
    fn location(&self) -> &str;

    async fn fetch(&self) -> Result<ToolSchemaCatalog, FederationError>;
}

/// Fetches `specs/tool_schemas.json` documents over HTTP.
pub struct HttpRegistrySource {
    url: String,
    client: reqwest::Client,
}

impl HttpRegistrySource {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(url, reqwest::Client::new())
    }

    pub fn with_client(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl RegistrySource for HttpRegistrySource {
    fn location(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<ToolSchemaCatalog, FederationError> {
        debug!(target: "helm::federation", url = %self.url, "Fetching registry catalog");
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| FederationError::Fetch {
                url: self.url.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FederationError::Fetch {
                url: self.url.clone(),
                message: format!("registry returned {status}"),
            });
        }

        let text = response.text().await.map_err(|e| FederationError::Fetch {
            url: self.url.clone(),
            message: e.to_string(),
        })?;
        ToolSchemaCatalog::from_json(&text).map_err(|e| FederationError::Parse {
            url: self.url.clone(),
            message: e.to_string(),
        })
    }
}
