//! Pull request endpoints

use keel_core::dto::git::{CreatePullRequest, PullRequestInfo};
use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::GitHubClient;
use crate::error::Result;

#[derive(Debug, Deserialize)]
struct User {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Head {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    number: u64,
    html_url: String,
    #[serde(default)]
    title: String,
    user: Option<User>,
    state: String,
    #[serde(default)]
    merged: bool,
    merge_commit_sha: Option<String>,
    mergeable: Option<bool>,
    head: Head,
}

impl PullRequest {
    fn into_info(self, owner: &str, repository: &str) -> PullRequestInfo {
        PullRequestInfo {
            owner: owner.to_string(),
            repository: repository.to_string(),
            number: self.number,
            url: self.html_url,
            title: self.title,
            author: self.user.map(|user| user.login),
            state: self.state,
            merged: self.merged,
            merge_commit_sha: self.merge_commit_sha.filter(|sha| !sha.is_empty()),
            mergeable: self.mergeable,
            head_sha: self.head.sha,
        }
    }
}

#[derive(Debug, Serialize)]
struct MergeRequest<'a> {
    commit_message: &'a str,
    sha: &'a str,
}

#[derive(Debug, Deserialize)]
struct CombinedStatus {
    state: String,
}

impl GitHubClient {
    // =============================================================================
    // Pull Requests
    // =============================================================================

    /// Get a pull request by number
    pub async fn fetch_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequestInfo> {
        let url = self.repo_url(owner, repo, &format!("pulls/{number}"));
        let response = self.request(Method::GET, &url).send().await?;

        let pr: PullRequest = self.handle_response(response).await?;
        Ok(pr.into_info(owner, repo))
    }

    /// Open a pull request
    pub async fn open_pull_request(
        &self,
        owner: &str,
        repo: &str,
        req: &CreatePullRequest,
    ) -> Result<PullRequestInfo> {
        let url = self.repo_url(owner, repo, "pulls");
        let response = self.request(Method::POST, &url).json(req).send().await?;

        let pr: PullRequest = self.handle_response(response).await?;
        Ok(pr.into_info(owner, repo))
    }

    /// Merge a pull request at its current head
    pub async fn merge(&self, pr: &PullRequestInfo, message: &str) -> Result<()> {
        let url = self.repo_url(&pr.owner, &pr.repository, &format!("pulls/{}/merge", pr.number));
        let body = MergeRequest {
            commit_message: message,
            sha: &pr.head_sha,
        };
        let response = self.request(Method::PUT, &url).json(&body).send().await?;

        self.handle_empty_response(response).await
    }

    /// Combined status of the pull request's head commit
    ///
    /// One of `pending`, `success`, `error` or `failure`.
    pub async fn combined_status(&self, pr: &PullRequestInfo) -> Result<String> {
        let url = self.repo_url(
            &pr.owner,
            &pr.repository,
            &format!("commits/{}/status", pr.head_sha),
        );
        let response = self.request(Method::GET, &url).send().await?;

        let status: CombinedStatus = self.handle_response(response).await?;
        Ok(status.state)
    }
}
