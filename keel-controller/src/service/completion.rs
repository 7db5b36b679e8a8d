//! Side effects of a pipeline reaching a terminal status
//!
//! Logs are captured to long-term storage and the activity is enriched with
//! author and commit details from the git provider. Both are best effort:
//! failures are logged and never block the status update.

use std::sync::Arc;

use anyhow::{Context, Result};
use keel_client::{BucketCollector, GitPagesCollector, GitProvider, LogCollector};
use keel_core::domain::activity::PipelineActivity;
use keel_core::domain::environment::DEV_ENVIRONMENT;
use keel_core::domain::pod::PodSnapshot;
use keel_core::git::GitRepository;
use keel_core::naming::step_title;
use tracing::{debug, info, warn};

use crate::repository::{BuildLogSource, ResourceStore};
use crate::service::masker::LogMasker;

const LOGS_CLASSIFIER: &str = "logs";

/// Where the logs of one activity are stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Bucket(String),
    GitPages {
        owner: String,
        repository: String,
        branch: Option<String>,
    },
}

/// Storage path of an activity's build log
pub fn log_path(activity: &PipelineActivity) -> String {
    let spec = &activity.spec;
    let build = if spec.build.is_empty() { "1" } else { &spec.build };
    format!(
        "keel/logs/{}/{}/{}/{}.log",
        spec.git_owner, spec.git_repository, spec.git_branch, build
    )
}

pub struct CompletionEffects {
    store: Arc<dyn ResourceStore>,
    logs: Arc<dyn BuildLogSource>,
    git: Arc<dyn GitProvider>,
    bucket_url: Option<String>,
    dry_run: bool,
}

impl CompletionEffects {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        logs: Arc<dyn BuildLogSource>,
        git: Arc<dyn GitProvider>,
        bucket_url: Option<String>,
        dry_run: bool,
    ) -> Self {
        Self {
            store,
            logs,
            git,
            bucket_url,
            dry_run,
        }
    }

    /// Runs every completion side effect against `activity`
    pub async fn on_completed(&self, activity: &mut PipelineActivity, pods: &[&PodSnapshot]) {
        if self.dry_run {
            info!(activity = %activity.name(), "Dry run: skipping log capture and enrichment");
            return;
        }

        if activity.spec.build_logs_url.is_empty() {
            match self.capture_logs(activity, pods).await {
                Ok(url) => {
                    info!(activity = %activity.name(), url = %url, "Captured build logs");
                    activity.spec.build_logs_url = url;
                }
                Err(e) => warn!(activity = %activity.name(), error = %format!("{e:#}"), "Failed to capture build logs"),
            }
        }

        if let Err(e) = self.enrich_source_info(activity).await {
            warn!(activity = %activity.name(), error = %format!("{e:#}"), "Failed to enrich source info");
        }
    }

    /// Resolves the log storage location
    ///
    /// The dev environment's team settings win, then the configured bucket,
    /// then the activity's own repository.
    pub async fn log_target(&self, activity: &PipelineActivity) -> Result<LogTarget> {
        let location = self
            .store
            .get_environment(DEV_ENVIRONMENT)
            .await
            .context("Failed to load dev environment")?
            .and_then(|env| env.spec.team_settings)
            .and_then(|settings| settings.storage_location(LOGS_CLASSIFIER).cloned())
            .filter(|location| !location.is_empty());

        if let Some(location) = location {
            if !location.bucket_url.is_empty() {
                return Ok(LogTarget::Bucket(location.bucket_url));
            }
            if !location.git_url.is_empty() {
                let repo = GitRepository::parse(&location.git_url)
                    .with_context(|| format!("Invalid log storage git URL {}", location.git_url))?;
                let branch = Some(location.git_branch).filter(|b| !b.is_empty());
                return Ok(LogTarget::GitPages {
                    owner: repo.organisation,
                    repository: repo.name,
                    branch,
                });
            }
        }

        if let Some(bucket) = &self.bucket_url {
            return Ok(LogTarget::Bucket(bucket.clone()));
        }

        let repo = GitRepository::parse(&activity.spec.git_url)
            .with_context(|| format!("Invalid activity git URL '{}'", activity.spec.git_url))?;
        Ok(LogTarget::GitPages {
            owner: repo.organisation,
            repository: repo.name,
            branch: None,
        })
    }

    fn collector(&self, target: LogTarget) -> Box<dyn LogCollector> {
        match target {
            LogTarget::Bucket(url) => Box::new(BucketCollector::new(url)),
            LogTarget::GitPages {
                owner,
                repository,
                branch,
            } => Box::new(GitPagesCollector::new(
                Arc::clone(&self.git),
                owner,
                repository,
                branch,
            )),
        }
    }

    async fn capture_logs(&self, activity: &PipelineActivity, pods: &[&PodSnapshot]) -> Result<String> {
        let target = self.log_target(activity).await?;
        let secrets = self
            .store
            .list_secret_values()
            .await
            .context("Failed to load secrets for masking")?;
        let masker = LogMasker::new(secrets);

        let mut data = String::new();
        for pod in pods {
            for container in pod.step_containers() {
                let text = self
                    .logs
                    .container_logs(pod, &container.name)
                    .await
                    .with_context(|| format!("Failed to read logs of {}/{}", pod.name, container.name))?;
                data.push_str(&format!("\n{}\n\n", step_title(&container.name)));
                for line in text.lines() {
                    data.push_str(&masker.mask(line));
                    data.push('\n');
                }
            }
        }

        let path = log_path(activity);
        debug!(activity = %activity.name(), path = %path, ?target, "Storing build logs");
        let url = self
            .collector(target)
            .collect_data(data.into_bytes(), &path)
            .await
            .context("Failed to store build logs")?;
        Ok(url)
    }

    /// Fills author, pull request title and commit message when missing
    pub async fn enrich_source_info(&self, activity: &mut PipelineActivity) -> Result<()> {
        let spec = &mut activity.spec;
        if !spec.author.is_empty() || spec.git_owner.is_empty() || spec.git_repository.is_empty() {
            return Ok(());
        }

        let pr_number = spec
            .git_branch
            .strip_prefix("PR-")
            .and_then(|n| n.parse::<u64>().ok());
        match pr_number {
            Some(number) => {
                let pr = self
                    .git
                    .get_pull_request(&spec.git_owner, &spec.git_repository, number)
                    .await
                    .with_context(|| format!("Failed to load pull request {number}"))?;
                if let Some(author) = pr.author {
                    spec.author = author;
                }
                if spec.pull_title.is_empty() {
                    spec.pull_title = pr.title;
                }
            }
            None => {
                let commits = self
                    .git
                    .list_commits(&spec.git_owner, &spec.git_repository, &spec.git_branch, 1, 1)
                    .await
                    .with_context(|| format!("Failed to list commits of {}", spec.git_branch))?;
                if let Some(commit) = commits.into_iter().next() {
                    if let Some(author) = commit.author {
                        spec.author = author;
                    }
                    if spec.last_commit_message.is_empty() {
                        spec.last_commit_message = commit.message;
                    }
                    if spec.last_commit_sha.is_empty() {
                        spec.last_commit_sha = commit.sha;
                    }
                }
            }
        }
        Ok(())
    }
}
