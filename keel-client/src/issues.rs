//! Issue comment endpoints

use reqwest::Method;
use serde::Serialize;

use crate::GitHubClient;
use crate::error::Result;

#[derive(Debug, Serialize)]
struct Comment<'a> {
    body: &'a str,
}

impl GitHubClient {
    /// Comment on an issue or pull request
    pub async fn comment(&self, owner: &str, repo: &str, number: u64, body: &str) -> Result<()> {
        let url = self.repo_url(owner, repo, &format!("issues/{number}/comments"));
        let response = self
            .request(Method::POST, &url)
            .json(&Comment { body })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }
}
