//! Promotion of released versions into environments
//!
//! A promotion is a pull request against the environment's source
//! repository that pins the application to the new version.

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use keel_client::GitProvider;
use keel_core::domain::activity::PipelineActivity;
use keel_core::dto::git::CreatePullRequest;
use keel_core::git::GitRepository;
use regex::Regex;
use tracing::{info, warn};

use crate::repository::ResourceStore;

static ISSUE_REFERENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#(\d+)\b").unwrap());

/// A version to promote into one environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionRequest {
    pub activity: String,
    pub application: String,
    pub version: String,
    pub environment: String,
    /// Pull request this request replaces, when rebasing
    pub replaces: Option<u64>,
}

impl PromotionRequest {
    pub fn for_activity(activity: &PipelineActivity, environment: &str) -> Self {
        Self {
            activity: activity.name().to_string(),
            application: activity.spec.git_repository.clone(),
            version: activity.spec.version.clone(),
            environment: environment.to_string(),
            replaces: None,
        }
    }

    /// The same promotion, rebuilt on a fresh branch to replace `pr`
    pub fn rebase_of(mut self, pr: u64) -> Self {
        self.replaces = Some(pr);
        self
    }

    pub fn branch_name(&self) -> String {
        match self.replaces {
            Some(pr) => format!("promote-{}-{}-rebase-{pr}", self.application, self.version),
            None => format!("promote-{}-{}", self.application, self.version),
        }
    }

    pub fn version_file(&self) -> String {
        format!("env/versions/{}", self.application)
    }

    pub fn title(&self) -> String {
        format!("chore: {} to {}", self.application, self.version)
    }

    pub fn body(&self) -> String {
        format!(
            "chore: Promote {} to version {}",
            self.application, self.version
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionOutcome {
    pub pull_request_url: String,
    pub number: u64,
}

#[async_trait]
pub trait Promoter: Send + Sync {
    async fn promote(&self, request: &PromotionRequest) -> Result<PromotionOutcome>;
}

/// Opens promotion pull requests through the git provider
pub struct PullRequestPromoter {
    store: Arc<dyn ResourceStore>,
    git: Arc<dyn GitProvider>,
}

impl PullRequestPromoter {
    pub fn new(store: Arc<dyn ResourceStore>, git: Arc<dyn GitProvider>) -> Self {
        Self { store, git }
    }
}

#[async_trait]
impl Promoter for PullRequestPromoter {
    async fn promote(&self, request: &PromotionRequest) -> Result<PromotionOutcome> {
        let env = self
            .store
            .get_environment(&request.environment)
            .await
            .with_context(|| format!("Failed to load environment {}", request.environment))?
            .ok_or_else(|| anyhow!("Environment {} not found", request.environment))?;
        let repo = GitRepository::parse(&env.spec.source.url).with_context(|| {
            format!(
                "Environment {} has an invalid source URL '{}'",
                request.environment, env.spec.source.url
            )
        })?;
        let base = env.base_branch();
        let branch = request.branch_name();

        self.git
            .create_branch(&repo.organisation, &repo.name, base, &branch)
            .await
            .with_context(|| format!("Failed to create branch {branch}"))?;
        self.git
            .put_file(
                &repo.organisation,
                &repo.name,
                &branch,
                &request.version_file(),
                format!("{}\n", request.version).as_bytes(),
                &request.title(),
            )
            .await
            .context("Failed to write version file")?;
        let pr = self
            .git
            .create_pull_request(
                &repo.organisation,
                &repo.name,
                &CreatePullRequest {
                    title: request.title(),
                    body: request.body(),
                    head: branch,
                    base: base.to_string(),
                },
            )
            .await
            .context("Failed to open promotion pull request")?;

        info!(
            activity = %request.activity,
            environment = %request.environment,
            version = %request.version,
            url = %pr.url,
            "Opened promotion pull request"
        );
        Ok(PromotionOutcome {
            pull_request_url: pr.url,
            number: pr.number,
        })
    }
}

/// Issue numbers referenced as `#n` in `text`
pub fn issue_references(text: &str) -> Vec<u64> {
    let numbers: BTreeSet<u64> = ISSUE_REFERENCE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
        .collect();
    numbers.into_iter().collect()
}

/// Tells every issue referenced by the activity where its fix was deployed
pub async fn comment_on_issues(
    git: &dyn GitProvider,
    activity: &PipelineActivity,
    environment: &str,
) {
    let spec = &activity.spec;
    if spec.git_owner.is_empty() || spec.git_repository.is_empty() {
        return;
    }
    let text = format!("{}\n{}", spec.last_commit_message, spec.pull_title);
    let body = format!(
        ":white_check_mark: the fix for this issue is now deployed to **{environment}** in version {}",
        spec.version
    );
    for number in issue_references(&text) {
        if let Err(e) = git
            .create_issue_comment(&spec.git_owner, &spec.git_repository, number, &body)
            .await
        {
            warn!(
                activity = %activity.name(),
                issue = number,
                error = %e,
                "Failed to comment on issue"
            );
        }
    }
}
