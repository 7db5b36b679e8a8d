//! Keel HTTP Client
//!
//! Clients for the external systems the Keel controllers talk to:
//!
//! - [`GitProvider`]: the provider-agnostic set of git operations the
//!   controllers need, with a GitHub REST implementation in [`GitHubClient`]
//! - [`LogCollector`]: long-term storage for build logs
//!
//! # Example
//!
//! ```no_run
//! use keel_client::{GitHubClient, GitProvider};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = GitHubClient::new("https://api.github.com", "my-token");
//!
//!     let pr = client.get_pull_request("org", "environment-staging", 12).await?;
//!     println!("PR {} merged: {}", pr.number, pr.merged);
//!     Ok(())
//! }
//! ```

mod commits;
mod contents;
pub mod error;
mod issues;
mod provider;
mod pulls;
pub mod storage;

// Re-export commonly used types
pub use error::{ClientError, Result};
pub use provider::GitProvider;
pub use storage::{BucketCollector, GitPagesCollector, LogCollector};

use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;

/// HTTP client for the GitHub REST API
///
/// Endpoints are grouped by area:
/// - Pull requests (get, create, merge, combined status)
/// - Commits and commit statuses
/// - Issue comments
/// - Branches and file contents
#[derive(Debug, Clone)]
pub struct GitHubClient {
    /// Base URL of the API (e.g., "https://api.github.com")
    base_url: String,
    /// Token sent as a bearer credential; empty for anonymous access
    token: String,
    /// HTTP client instance
    client: Client,
}

impl GitHubClient {
    /// Create a new GitHub client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the API (e.g., "https://api.github.com")
    /// * `token` - API token, may be empty
    ///
    /// # Example
    /// ```
    /// use keel_client::GitHubClient;
    ///
    /// let client = GitHubClient::new("https://api.github.com", "");
    /// ```
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(base_url, token, Client::new())
    }

    /// Create a new GitHub client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    ///
    /// # Example
    /// ```
    /// use keel_client::GitHubClient;
    /// use reqwest::Client;
    /// use std::time::Duration;
    ///
    /// let http_client = Client::builder()
    ///     .timeout(Duration::from_secs(30))
    ///     .build()
    ///     .unwrap();
    ///
    /// let client = GitHubClient::with_client("https://api.github.com", "", http_client);
    /// ```
    pub fn with_client(base_url: impl Into<String>, token: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            client,
        }
    }

    /// Get the base URL of the API
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL of a repository-scoped endpoint
    fn repo_url(&self, owner: &str, repo: &str, path: &str) -> String {
        format!("{}/repos/{}/{}/{}", self.base_url, owner, repo, path)
    }

    /// Start a request carrying the API headers and credentials
    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "keel");
        if self.token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.token)
        }
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    ///
    /// This method checks the status code and returns an appropriate error if
    /// the request failed, or deserializes the response body if successful.
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::status(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::Decode(format!("invalid JSON: {e}")))
    }

    /// Handle an API response whose body is not needed
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::status(status.as_u16(), error_text));
        }

        Ok(())
    }
}
