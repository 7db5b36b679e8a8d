//! Git provider DTOs

use serde::{Deserialize, Serialize};

/// A pull request as seen by the controllers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestInfo {
    pub owner: String,
    pub repository: String,
    pub number: u64,
    pub url: String,
    pub title: String,
    pub author: Option<String>,
    /// `open` or `closed`
    pub state: String,
    pub merged: bool,
    pub merge_commit_sha: Option<String>,
    /// `None` while the provider is still computing it
    pub mergeable: Option<bool>,
    pub head_sha: String,
}

impl PullRequestInfo {
    pub fn is_closed(&self) -> bool {
        self.state.eq_ignore_ascii_case("closed")
    }
}

/// Request to open a pull request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePullRequest {
    pub title: String,
    pub body: String,
    /// Branch holding the change
    pub head: String,
    /// Branch to merge into
    pub base: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author: Option<String>,
}

/// One status check reported against a commit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatusInfo {
    pub id: String,
    /// `pending`, `success`, `error` or `failure`
    pub state: String,
    pub target_url: String,
    pub context: String,
    pub description: String,
}

impl CommitStatusInfo {
    pub fn is_success(&self) -> bool {
        self.state == "success"
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state.as_str(), "error" | "failure")
    }

    /// Identity of the check across repeated reports
    pub fn check_url(&self) -> &str {
        if self.target_url.is_empty() {
            &self.id
        } else {
            &self.target_url
        }
    }
}
