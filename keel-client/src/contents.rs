//! Branch and file content endpoints
//!
//! Used to publish promotion changes and build logs without a local clone.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::GitHubClient;
use crate::error::{ClientError, Result};

#[derive(Debug, Deserialize)]
struct Reference {
    object: ReferenceObject,
}

#[derive(Debug, Deserialize)]
struct ReferenceObject {
    sha: String,
}

#[derive(Debug, Serialize)]
struct CreateReference<'a> {
    #[serde(rename = "ref")]
    reference: String,
    sha: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExistingFile {
    sha: String,
}

#[derive(Debug, Serialize)]
struct PutFile<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PutFileResponse {
    content: PutFileContent,
}

#[derive(Debug, Deserialize)]
struct PutFileContent {
    download_url: Option<String>,
    html_url: Option<String>,
}

impl GitHubClient {
    // =============================================================================
    // Branches and Contents
    // =============================================================================

    /// Create `branch` at the head of `from`; an existing branch is left alone
    pub async fn branch_from(&self, owner: &str, repo: &str, from: &str, branch: &str) -> Result<()> {
        let url = self.repo_url(owner, repo, &format!("git/ref/heads/{from}"));
        let response = self.request(Method::GET, &url).send().await?;
        let base: Reference = self.handle_response(response).await?;

        let url = self.repo_url(owner, repo, "git/refs");
        let body = CreateReference {
            reference: format!("refs/heads/{branch}"),
            sha: &base.object.sha,
        };
        let response = self.request(Method::POST, &url).json(&body).send().await?;
        match self.handle_empty_response(response).await {
            Err(e) if e.is_already_exists() => Ok(()),
            other => other,
        }
    }

    /// Create or replace a file on `branch`, returning its download URL
    pub async fn write_file(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
        data: &[u8],
        message: &str,
    ) -> Result<String> {
        let url = self.repo_url(owner, repo, &format!("contents/{path}"));

        let response = self
            .request(Method::GET, &url)
            .query(&[("ref", branch)])
            .send()
            .await?;
        let sha = match self.handle_response::<ExistingFile>(response).await {
            Ok(file) => Some(file.sha),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let body = PutFile {
            message,
            content: BASE64.encode(data),
            branch,
            sha,
        };
        let response = self.request(Method::PUT, &url).json(&body).send().await?;
        let written: PutFileResponse = self.handle_response(response).await?;

        written
            .content
            .download_url
            .or(written.content.html_url)
            .ok_or_else(|| ClientError::Decode(format!("no URL returned for {path}")))
    }
}
