//! Long-term log storage
//!
//! Build logs are written once, when a pipeline finishes, to either an HTTP
//! bucket or a branch of a git repository.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::provider::GitProvider;

/// Branch git-backed log storage commits to
pub const DEFAULT_PAGES_BRANCH: &str = "gh-pages";

#[async_trait]
pub trait LogCollector: Send + Sync {
    /// Stores `data` under `path`, returning the URL it can be read from
    async fn collect_data(&self, data: Vec<u8>, path: &str) -> Result<String>;
}

/// Stores objects with an HTTP `PUT` below a bucket URL
pub struct BucketCollector {
    client: Client,
    base_url: String,
}

impl BucketCollector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl LogCollector for BucketCollector {
    async fn collect_data(&self, data: Vec<u8>, path: &str) -> Result<String> {
        let url = self.object_url(path);
        debug!(url = %url, bytes = data.len(), "Uploading to bucket");

        let response = self.client.put(&url).body(data).send().await?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::status(status.as_u16(), error_text));
        }
        Ok(url)
    }
}

/// Commits objects to a branch of a git repository
pub struct GitPagesCollector {
    provider: Arc<dyn GitProvider>,
    owner: String,
    repository: String,
    branch: String,
}

impl GitPagesCollector {
    pub fn new(
        provider: Arc<dyn GitProvider>,
        owner: impl Into<String>,
        repository: impl Into<String>,
        branch: Option<String>,
    ) -> Self {
        Self {
            provider,
            owner: owner.into(),
            repository: repository.into(),
            branch: branch
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| DEFAULT_PAGES_BRANCH.to_string()),
        }
    }
}

#[async_trait]
impl LogCollector for GitPagesCollector {
    async fn collect_data(&self, data: Vec<u8>, path: &str) -> Result<String> {
        debug!(
            owner = %self.owner,
            repository = %self.repository,
            branch = %self.branch,
            path,
            "Committing to git storage"
        );
        self.provider
            .put_file(
                &self.owner,
                &self.repository,
                &self.branch,
                path,
                &data,
                &format!("chore: add {path}"),
            )
            .await
    }
}
