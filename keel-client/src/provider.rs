//! Provider-agnostic git operations
//!
//! The controllers only ever talk to a git provider through [`GitProvider`].
//! Implementations translate to one provider's API; [`GitHubClient`] is the
//! GitHub REST implementation.

use async_trait::async_trait;
use keel_core::dto::git::{CommitInfo, CommitStatusInfo, CreatePullRequest, PullRequestInfo};

use crate::GitHubClient;
use crate::error::Result;

#[async_trait]
pub trait GitProvider: Send + Sync {
    async fn get_pull_request(&self, owner: &str, repo: &str, number: u64) -> Result<PullRequestInfo>;

    /// Aggregate status of the pull request's last commit
    async fn pull_request_last_commit_status(&self, pr: &PullRequestInfo) -> Result<String>;

    async fn merge_pull_request(&self, pr: &PullRequestInfo, message: &str) -> Result<()>;

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        req: &CreatePullRequest,
    ) -> Result<PullRequestInfo>;

    /// Commits reachable from `sha`, one page at a time
    async fn list_commits(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<CommitInfo>>;

    async fn list_commit_statuses(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<Vec<CommitStatusInfo>>;

    async fn update_commit_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        status: &CommitStatusInfo,
    ) -> Result<()>;

    async fn create_issue_comment(&self, owner: &str, repo: &str, number: u64, body: &str) -> Result<()>;

    /// Creates `branch` from the head of `from` unless it already exists
    async fn create_branch(&self, owner: &str, repo: &str, from: &str, branch: &str) -> Result<()>;

    /// Commits `data` to `path` on `branch`, returning a URL to the file
    async fn put_file(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
        data: &[u8],
        message: &str,
    ) -> Result<String>;
}

#[async_trait]
impl GitProvider for GitHubClient {
    async fn get_pull_request(&self, owner: &str, repo: &str, number: u64) -> Result<PullRequestInfo> {
        self.fetch_pull_request(owner, repo, number).await
    }

    async fn pull_request_last_commit_status(&self, pr: &PullRequestInfo) -> Result<String> {
        self.combined_status(pr).await
    }

    async fn merge_pull_request(&self, pr: &PullRequestInfo, message: &str) -> Result<()> {
        self.merge(pr, message).await
    }

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        req: &CreatePullRequest,
    ) -> Result<PullRequestInfo> {
        self.open_pull_request(owner, repo, req).await
    }

    async fn list_commits(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<CommitInfo>> {
        self.commits(owner, repo, sha, page, per_page).await
    }

    async fn list_commit_statuses(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<Vec<CommitStatusInfo>> {
        self.statuses(owner, repo, sha).await
    }

    async fn update_commit_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        status: &CommitStatusInfo,
    ) -> Result<()> {
        self.create_status(owner, repo, sha, status).await
    }

    async fn create_issue_comment(&self, owner: &str, repo: &str, number: u64, body: &str) -> Result<()> {
        self.comment(owner, repo, number, body).await
    }

    async fn create_branch(&self, owner: &str, repo: &str, from: &str, branch: &str) -> Result<()> {
        self.branch_from(owner, repo, from, branch).await
    }

    async fn put_file(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
        data: &[u8],
        message: &str,
    ) -> Result<String> {
        self.write_file(owner, repo, branch, path, data, message).await
    }
}
