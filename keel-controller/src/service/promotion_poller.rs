//! Promotion pull request polling
//!
//! Open promotions are advanced by polling their pull requests: green pull
//! requests are merged, merged ones wait for the environment pipeline checks
//! on the merge commit, and conflicting ones are rebuilt on a fresh branch.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use keel_client::{ClientError, GitProvider};
use keel_core::domain::activity::{GitStatus, PipelineActivity, PromoteActivityStep};
use keel_core::domain::status::ActivityStatus;
use keel_core::dto::git::{CommitStatusInfo, PullRequestInfo};
use keel_core::git::PullRequestRef;
use tracing::{debug, info, warn};

use crate::config::WorkflowConfig;
use crate::repository::{ResourceStore, patch_activity};
use crate::service::dedup::DedupGate;
use crate::service::promotion::{PromotionRequest, Promoter, comment_on_issues};

pub const MERGE_MESSAGE: &str = "keel automatically merged promotion PR";

/// Latest state of every distinct check on a commit
///
/// Statuses arrive newest first; the first one seen for a check URL wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckSummary {
    pub checks: BTreeMap<String, String>,
}

impl CheckSummary {
    pub fn of(statuses: &[CommitStatusInfo]) -> Self {
        let mut checks = BTreeMap::new();
        for status in statuses {
            checks
                .entry(status.check_url().to_string())
                .or_insert_with(|| status.state.clone());
        }
        Self { checks }
    }

    pub fn all_succeeded(&self) -> bool {
        !self.checks.is_empty() && self.checks.values().all(|state| state == "success")
    }

    pub fn failed(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|(_, state)| matches!(state.as_str(), "error" | "failure"))
            .map(|(url, _)| url.as_str())
            .collect()
    }

    pub fn statuses(&self) -> Vec<GitStatus> {
        self.checks
            .iter()
            .map(|(url, status)| GitStatus {
                url: url.clone(),
                status: status.clone(),
            })
            .collect()
    }
}

/// True when the failure came from a provider outage rather than the promotion
pub(crate) fn is_transient(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| cause.downcast_ref::<ClientError>().is_some_and(ClientError::is_transient))
}

/// A promotion that still needs polling
fn is_pollable(promote: &PromoteActivityStep) -> bool {
    let pr_abandoned = promote
        .pull_request
        .as_ref()
        .is_some_and(|pr| pr.core.status.is_failure());
    !promote.core.status.is_terminated() && !pr_abandoned && promote.pull_request_url().is_some()
}

pub struct PromotionPoller {
    store: Arc<dyn ResourceStore>,
    git: Arc<dyn GitProvider>,
    promoter: Arc<dyn Promoter>,
    config: WorkflowConfig,
    dry_run: bool,
}

impl PromotionPoller {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        git: Arc<dyn GitProvider>,
        promoter: Arc<dyn Promoter>,
        config: WorkflowConfig,
        dry_run: bool,
    ) -> Self {
        Self {
            store,
            git,
            promoter,
            config,
            dry_run,
        }
    }

    /// Reloads the activities and polls every open promotion
    ///
    /// Returns the number of activities polled.
    pub async fn poll(&self, gate: &mut DedupGate) -> Result<usize> {
        let activities = self
            .store
            .list_activities()
            .await
            .context("Failed to list activities")?;

        let mut polled = 0;
        for activity in activities {
            if activity.spec.workflow.is_empty() || activity.spec.workflow_status.is_terminated() {
                continue;
            }
            if !activity.promotes().any(is_pollable) {
                continue;
            }
            self.poll_activity(gate, &activity).await;
            polled += 1;
        }
        Ok(polled)
    }

    pub async fn poll_activity(&self, gate: &mut DedupGate, activity: &PipelineActivity) {
        if !self.config.is_release_branch(&activity.spec.git_branch) {
            debug!(activity = %activity.name(), branch = %activity.spec.git_branch, "Not a release branch, evicting");
            gate.forget(activity.name());
            return;
        }
        if !gate.is_newest(activity, self.store.as_ref(), self.dry_run).await {
            return;
        }
        gate.remember(activity.clone());

        let promotes: Vec<PromoteActivityStep> =
            activity.promotes().filter(|p| is_pollable(p)).cloned().collect();
        for promote in promotes {
            let Err(e) = self.poll_promotion(activity, &promote).await else {
                continue;
            };
            if is_transient(&e) {
                info!(
                    activity = %activity.name(),
                    environment = %promote.environment,
                    error = %e,
                    "Git provider unavailable, retrying on the next poll"
                );
            } else {
                warn!(
                    activity = %activity.name(),
                    environment = %promote.environment,
                    error = %format!("{e:#}"),
                    "Failed to poll promotion"
                );
            }
        }
    }

    async fn poll_promotion(&self, activity: &PipelineActivity, promote: &PromoteActivityStep) -> Result<()> {
        let Some(url) = promote.pull_request_url() else {
            return Ok(());
        };
        let pr_ref = PullRequestRef::parse(url)
            .with_context(|| format!("Invalid promotion pull request URL {url}"))?;
        let repo = &pr_ref.repository;
        let pr = self
            .git
            .get_pull_request(&repo.organisation, &repo.name, pr_ref.number)
            .await
            .with_context(|| format!("Failed to load pull request {url}"))?;

        if pr.merged {
            return self.on_merged(activity, promote, &pr).await;
        }
        if pr.is_closed() {
            return self.on_closed(activity, promote, url).await;
        }
        self.on_open(activity, promote, &pr).await
    }

    async fn on_merged(
        &self,
        activity: &PipelineActivity,
        promote: &PromoteActivityStep,
        pr: &PullRequestInfo,
    ) -> Result<()> {
        let environment = promote.environment.as_str();
        let Some(merge_sha) = pr.merge_commit_sha.clone().filter(|sha| !sha.is_empty()) else {
            warn!(activity = %activity.name(), environment, url = %pr.url, "Merged pull request has no merge commit yet");
            return Ok(());
        };

        if !self.config.wait_for_update() {
            info!(activity = %activity.name(), environment, sha = %merge_sha, "Promotion merged");
            let patched = self
                .patch(activity.name(), |a| {
                    let now = Utc::now();
                    if let Some(p) = a.promote_mut(environment) {
                        p.complete_pull_request(&merge_sha, now);
                        p.complete_update(now);
                    }
                })
                .await?;
            comment_on_issues(self.git.as_ref(), patched.as_ref().unwrap_or(activity), environment).await;
            return Ok(());
        }

        let statuses = self
            .git
            .list_commit_statuses(&pr.owner, &pr.repository, &merge_sha)
            .await
            .with_context(|| format!("Failed to list statuses of {merge_sha}"))?;
        let summary = CheckSummary::of(&statuses);
        let failed = summary.failed();
        if !failed.is_empty() {
            warn!(
                activity = %activity.name(),
                environment,
                sha = %merge_sha,
                failed = ?failed,
                "Environment pipeline failed, not completing promotion"
            );
        }
        let complete = failed.is_empty() && summary.all_succeeded();
        let recorded = summary.statuses();

        let patched = self
            .patch(activity.name(), |a| {
                let now = Utc::now();
                if let Some(p) = a.promote_mut(environment) {
                    p.complete_pull_request(&merge_sha, now);
                    p.start_update(now);
                    if let Some(update) = p.update.as_mut() {
                        update.statuses = recorded;
                    }
                    if complete {
                        p.complete_update(now);
                    }
                }
            })
            .await?;

        if complete {
            info!(activity = %activity.name(), environment, sha = %merge_sha, "Promotion complete");
            comment_on_issues(self.git.as_ref(), patched.as_ref().unwrap_or(activity), environment).await;
        }
        Ok(())
    }

    async fn on_closed(&self, activity: &PipelineActivity, promote: &PromoteActivityStep, url: &str) -> Result<()> {
        let environment = promote.environment.as_str();
        warn!(activity = %activity.name(), environment, url, "Promotion pull request closed without merging");
        let message = format!("Promotion pull request {url} was closed without merging");
        self.patch(activity.name(), |a| {
            if let Some(pr) = a
                .promote_mut(environment)
                .and_then(|p| p.pull_request.as_mut())
            {
                pr.core.status = ActivityStatus::Aborted;
            }
            a.spec.workflow_message = message;
        })
        .await?;
        Ok(())
    }

    async fn on_open(
        &self,
        activity: &PipelineActivity,
        promote: &PromoteActivityStep,
        pr: &PullRequestInfo,
    ) -> Result<()> {
        let environment = promote.environment.as_str();
        match self.git.pull_request_last_commit_status(pr).await {
            Ok(status) => match status.as_str() {
                "success" => {
                    if self.config.auto_merge() {
                        if self.dry_run {
                            info!(activity = %activity.name(), environment, url = %pr.url, "Dry run: would merge promotion");
                        } else {
                            self.git
                                .merge_pull_request(pr, MERGE_MESSAGE)
                                .await
                                .with_context(|| format!("Failed to merge {}", pr.url))?;
                            info!(activity = %activity.name(), environment, url = %pr.url, "Merged promotion pull request");
                        }
                        return Ok(());
                    }
                }
                "error" | "failure" => {
                    warn!(activity = %activity.name(), environment, url = %pr.url, status = %status, "Promotion checks failed");
                    return Ok(());
                }
                _ => debug!(activity = %activity.name(), environment, status = %status, "Promotion checks pending"),
            },
            Err(e) => warn!(activity = %activity.name(), environment, error = %e, "Failed to read promotion checks"),
        }

        if pr.mergeable == Some(false) {
            self.rebase(activity, environment, pr).await?;
        }
        Ok(())
    }

    async fn rebase(&self, activity: &PipelineActivity, environment: &str, pr: &PullRequestInfo) -> Result<()> {
        info!(activity = %activity.name(), environment, url = %pr.url, "Promotion pull request conflicts, rebasing");
        if self.dry_run {
            return Ok(());
        }
        let request = PromotionRequest::for_activity(activity, environment).rebase_of(pr.number);
        let outcome = self.promoter.promote(&request).await?;

        let url = outcome.pull_request_url.clone();
        self.patch(activity.name(), |a| {
            a.get_or_create_promote(environment, Utc::now())
                .start_pull_request(&url, Utc::now());
        })
        .await?;

        let body = format!("Superseded by {}", outcome.pull_request_url);
        if let Err(e) = self
            .git
            .create_issue_comment(&pr.owner, &pr.repository, pr.number, &body)
            .await
        {
            warn!(activity = %activity.name(), url = %pr.url, error = %e, "Failed to comment on replaced pull request");
        }
        Ok(())
    }

    async fn patch<F>(&self, name: &str, mutate: F) -> Result<Option<PipelineActivity>>
    where
        F: FnOnce(&mut PipelineActivity) + Send,
    {
        if self.dry_run {
            info!(activity = %name, "Dry run: not updating activity");
            return Ok(None);
        }
        patch_activity(self.store.as_ref(), name, mutate)
            .await
            .with_context(|| format!("Failed to update activity {name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeGitProvider, InMemoryStore, RecordingPromoter};

    const PR_URL: &str = "https://github.com/org/environment-staging/pull/9";

    fn promoting() -> PipelineActivity {
        let mut activity = PipelineActivity::new("org-app-master-3");
        activity.spec.pipeline = "org/app/master".to_string();
        activity.spec.build = "3".to_string();
        activity.spec.version = "0.0.3".to_string();
        activity.spec.git_owner = "org".to_string();
        activity.spec.git_repository = "app".to_string();
        activity.spec.git_branch = "master".to_string();
        activity.spec.workflow = "default".to_string();
        activity.spec.workflow_status = ActivityStatus::Running;
        activity.spec.status = ActivityStatus::Succeeded;
        activity.spec.last_commit_message = "fix #5".to_string();
        let now = Utc::now();
        activity
            .get_or_create_promote("staging", now)
            .start_pull_request(PR_URL, now);
        activity
    }

    fn pull_request(merged: bool, state: &str) -> PullRequestInfo {
        PullRequestInfo {
            owner: "org".to_string(),
            repository: "environment-staging".to_string(),
            number: 9,
            url: PR_URL.to_string(),
            state: state.to_string(),
            merged,
            merge_commit_sha: merged.then(|| "d".repeat(40)),
            ..Default::default()
        }
    }

    fn check(url: &str, state: &str) -> CommitStatusInfo {
        CommitStatusInfo {
            id: url.to_string(),
            state: state.to_string(),
            target_url: url.to_string(),
            ..Default::default()
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        git: Arc<FakeGitProvider>,
        promoter: Arc<RecordingPromoter>,
        poller: PromotionPoller,
    }

    fn harness(pr: PullRequestInfo, config: WorkflowConfig) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        store.insert_activity(promoting());
        let git = Arc::new(FakeGitProvider::new().with_pull_request(pr));
        let promoter = Arc::new(RecordingPromoter::default());
        let poller = PromotionPoller::new(store.clone(), git.clone(), promoter.clone(), config, false);
        Harness {
            store,
            git,
            promoter,
            poller,
        }
    }

    fn staging(store: &InMemoryStore) -> PromoteActivityStep {
        store
            .activity("org-app-master-3")
            .unwrap()
            .promote("staging")
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_check_summary_latest_state_wins() {
        let summary = CheckSummary::of(&[
            check("https://ci/b", "success"),
            check("https://ci/a", "success"),
            check("https://ci/b", "pending"),
        ]);
        assert!(summary.all_succeeded());
        assert_eq!(summary.statuses()[0].url, "https://ci/a");

        let failing = CheckSummary::of(&[check("https://ci/a", "failure"), check("https://ci/a", "success")]);
        assert_eq!(failing.failed(), vec!["https://ci/a"]);
        assert!(!CheckSummary::default().all_succeeded());
    }

    #[test]
    fn test_provider_outages_are_transient() {
        let outage = anyhow::Error::new(ClientError::status(502, "bad gateway"))
            .context("Failed to load pull request");
        assert!(is_transient(&outage));

        let missing = anyhow::Error::new(ClientError::NotFound("pull request 9".to_string()))
            .context("Failed to load pull request");
        assert!(!is_transient(&missing));
        assert!(!is_transient(&anyhow::anyhow!("Invalid promotion pull request URL")));
    }

    #[tokio::test]
    async fn test_merged_without_waiting() {
        let config = WorkflowConfig {
            no_wait_for_update_pipeline: true,
            ..WorkflowConfig::default()
        };
        let h = harness(pull_request(true, "closed"), config);
        let mut gate = DedupGate::new();

        assert_eq!(h.poller.poll(&mut gate).await.unwrap(), 1);

        let promote = staging(&h.store);
        assert_eq!(promote.core.status, ActivityStatus::Succeeded);
        let pr = promote.pull_request.unwrap();
        assert_eq!(pr.core.status, ActivityStatus::Succeeded);
        assert_eq!(pr.merge_commit_sha, "d".repeat(40));
        assert_eq!(promote.update.unwrap().core.status, ActivityStatus::Succeeded);
        assert_eq!(h.git.comments()[0].1, 5);
    }

    #[tokio::test]
    async fn test_merged_waits_for_every_check() {
        let h = harness(pull_request(true, "closed"), WorkflowConfig::default());
        h.git.set_commit_statuses(vec![
            check("https://ci/deploy", "success"),
            check("https://ci/smoke", "pending"),
        ]);
        let mut gate = DedupGate::new();

        h.poller.poll(&mut gate).await.unwrap();
        let promote = staging(&h.store);
        assert_eq!(promote.core.status, ActivityStatus::Running);
        let update = promote.update.unwrap();
        assert_eq!(update.core.status, ActivityStatus::Running);
        assert_eq!(update.statuses.len(), 2);
        assert_eq!(update.statuses[1].status, "pending");
        assert!(h.git.comments().is_empty());

        h.git.set_commit_statuses(vec![
            check("https://ci/smoke", "success"),
            check("https://ci/deploy", "success"),
            check("https://ci/smoke", "pending"),
        ]);
        h.poller.poll(&mut gate).await.unwrap();
        let promote = staging(&h.store);
        assert_eq!(promote.core.status, ActivityStatus::Succeeded);
        assert_eq!(h.git.comments().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_check_aborts_wait() {
        let h = harness(pull_request(true, "closed"), WorkflowConfig::default());
        h.git.set_commit_statuses(vec![
            check("https://ci/deploy", "failure"),
            check("https://ci/smoke", "success"),
        ]);
        let mut gate = DedupGate::new();

        h.poller.poll(&mut gate).await.unwrap();
        assert_eq!(staging(&h.store).core.status, ActivityStatus::Running);
        assert!(h.git.comments().is_empty());
    }

    #[tokio::test]
    async fn test_green_open_pull_request_is_merged() {
        let h = harness(pull_request(false, "open"), WorkflowConfig::default());
        h.git.set_last_commit_status("success");
        let mut gate = DedupGate::new();

        h.poller.poll(&mut gate).await.unwrap();
        assert_eq!(h.git.merged(), vec![9]);
    }

    #[tokio::test]
    async fn test_auto_merge_disabled() {
        let config = WorkflowConfig {
            no_merge_pull_request: true,
            ..WorkflowConfig::default()
        };
        let h = harness(pull_request(false, "open"), config);
        h.git.set_last_commit_status("success");
        let mut gate = DedupGate::new();

        h.poller.poll(&mut gate).await.unwrap();
        assert!(h.git.merged().is_empty());
    }

    #[tokio::test]
    async fn test_failing_pull_request_is_left_pending() {
        let h = harness(pull_request(false, "open"), WorkflowConfig::default());
        h.git.set_last_commit_status("failure");
        let mut gate = DedupGate::new();

        h.poller.poll(&mut gate).await.unwrap();
        assert!(h.git.merged().is_empty());
        assert_eq!(staging(&h.store).core.status, ActivityStatus::Running);
    }

    #[tokio::test]
    async fn test_conflicting_pull_request_is_rebased() {
        let mut pr = pull_request(false, "open");
        pr.mergeable = Some(false);
        let h = harness(pr, WorkflowConfig::default());
        h.git.set_last_commit_status("pending");
        let mut gate = DedupGate::new();

        h.poller.poll(&mut gate).await.unwrap();

        let requests = h.promoter.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].replaces, Some(9));
        assert_eq!(
            staging(&h.store).pull_request_url(),
            Some("https://github.com/org/environment-staging/pull/1")
        );
        assert!(h.git.comments()[0].2.starts_with("Superseded by"));
    }

    #[tokio::test]
    async fn test_closed_pull_request_stops_polling() {
        let h = harness(pull_request(false, "closed"), WorkflowConfig::default());
        let mut gate = DedupGate::new();

        assert_eq!(h.poller.poll(&mut gate).await.unwrap(), 1);
        let activity = h.store.activity("org-app-master-3").unwrap();
        assert!(activity.spec.workflow_message.contains("closed without merging"));
        assert_eq!(activity.promote("staging").unwrap().core.status, ActivityStatus::Running);

        assert_eq!(h.poller.poll(&mut gate).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_non_release_branch_is_evicted() {
        let h = harness(pull_request(false, "open"), WorkflowConfig::default());
        let mut activity = promoting();
        activity.spec.git_branch = "feature".to_string();
        let mut gate = DedupGate::new();
        gate.remember(activity.clone());

        h.poller.poll_activity(&mut gate, &activity).await;
        assert_eq!(gate.tracked(), 0);
        assert!(h.git.merged().is_empty());
    }
}
