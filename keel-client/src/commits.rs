//! Commit and commit status endpoints

use keel_core::dto::git::{CommitInfo, CommitStatusInfo};
use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::GitHubClient;
use crate::error::Result;

#[derive(Debug, Deserialize)]
struct Commit {
    sha: String,
    commit: CommitDetail,
    author: Option<Author>,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Author {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Status {
    id: u64,
    state: String,
    target_url: Option<String>,
    #[serde(default)]
    context: String,
    description: Option<String>,
}

impl From<Status> for CommitStatusInfo {
    fn from(status: Status) -> Self {
        Self {
            id: status.id.to_string(),
            state: status.state,
            target_url: status.target_url.unwrap_or_default(),
            context: status.context,
            description: status.description.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateStatus<'a> {
    state: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    target_url: &'a str,
    description: &'a str,
    context: &'a str,
}

impl GitHubClient {
    // =============================================================================
    // Commits
    // =============================================================================

    /// List commits reachable from `sha` (a branch or commit)
    pub async fn commits(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<CommitInfo>> {
        let url = self.repo_url(owner, repo, "commits");
        let response = self
            .request(Method::GET, &url)
            .query(&[
                ("sha", sha.to_string()),
                ("page", page.to_string()),
                ("per_page", per_page.to_string()),
            ])
            .send()
            .await?;

        let commits: Vec<Commit> = self.handle_response(response).await?;
        Ok(commits
            .into_iter()
            .map(|c| CommitInfo {
                sha: c.sha,
                message: c.commit.message,
                author: c.author.map(|a| a.login),
            })
            .collect())
    }

    /// Every status reported against a commit, newest first
    pub async fn statuses(&self, owner: &str, repo: &str, sha: &str) -> Result<Vec<CommitStatusInfo>> {
        let url = self.repo_url(owner, repo, &format!("commits/{sha}/statuses"));
        let response = self.request(Method::GET, &url).send().await?;

        let statuses: Vec<Status> = self.handle_response(response).await?;
        Ok(statuses.into_iter().map(CommitStatusInfo::from).collect())
    }

    /// Report a status against a commit
    pub async fn create_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        status: &CommitStatusInfo,
    ) -> Result<()> {
        let url = self.repo_url(owner, repo, &format!("statuses/{sha}"));
        let body = CreateStatus {
            state: &status.state,
            target_url: &status.target_url,
            description: &status.description,
            context: &status.context,
        };
        let response = self.request(Method::POST, &url).json(&body).send().await?;

        self.handle_empty_response(response).await
    }
}
