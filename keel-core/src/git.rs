//! Git URL parsing
//!
//! Understands `https://host/org/repo(.git)`, `git@host:org/repo.git` and pull
//! request URLs such as `https://github.com/org/repo/pull/12`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid git URL '{0}'")]
    InvalidUrl(String),

    #[error("invalid pull request URL '{0}'")]
    InvalidPullRequestUrl(String),
}

/// Host, organisation and name of a git repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRepository {
    pub host: String,
    pub organisation: String,
    pub name: String,
}

impl GitRepository {
    pub fn parse(url: &str) -> Result<Self, ParseError> {
        let (host, segments) =
            split_url(url).ok_or_else(|| ParseError::InvalidUrl(url.to_string()))?;
        Self::from_segments(host, &segments).ok_or_else(|| ParseError::InvalidUrl(url.to_string()))
    }

    fn from_segments(host: &str, segments: &[&str]) -> Option<Self> {
        let (name, organisation) = segments.split_last()?;
        if organisation.is_empty() {
            return None;
        }
        let name = name.trim_end_matches(".git");
        if name.is_empty() {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            organisation: organisation.join("/"),
            name: name.to_string(),
        })
    }

    /// Clone URL over https
    pub fn https_url(&self) -> String {
        format!("{}.git", self.html_url())
    }

    pub fn html_url(&self) -> String {
        format!("https://{}/{}/{}", self.host, self.organisation, self.name)
    }
}

/// A pull request identified by its URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRef {
    pub repository: GitRepository,
    pub number: u64,
}

impl PullRequestRef {
    pub fn parse(url: &str) -> Result<Self, ParseError> {
        let invalid = || ParseError::InvalidPullRequestUrl(url.to_string());
        let (host, mut segments) = split_url(url).ok_or_else(invalid)?;

        let number = segments
            .pop()
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(invalid)?;
        while matches!(
            segments.last(),
            Some(&"pull") | Some(&"pulls") | Some(&"merge_requests") | Some(&"-")
        ) {
            segments.pop();
        }

        let repository = GitRepository::from_segments(host, &segments).ok_or_else(invalid)?;
        Ok(Self { repository, number })
    }
}

/// Splits a URL into its host and non-empty path segments
fn split_url(url: &str) -> Option<(&str, Vec<&str>)> {
    let url = url.trim();
    let (authority, path) = match url.split_once("://") {
        Some((_, rest)) => rest.split_once('/')?,
        None => {
            // scp-like syntax: git@host:org/repo.git
            let (authority, path) = url.split_once(':')?;
            (authority, path)
        }
    };
    let host = authority.rsplit('@').next().unwrap_or(authority);
    if host.is_empty() {
        return None;
    }
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    Some((host, segments))
}
