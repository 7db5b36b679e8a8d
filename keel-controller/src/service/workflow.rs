//! Promotion workflow engine
//!
//! Drives each released activity through the promote steps of its workflow.
//! The engine owns the workflow cache and the dedup gate; it is only ever
//! driven from the single workflow worker task, so neither needs locking.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use keel_core::domain::activity::PipelineActivity;
use keel_core::domain::status::ActivityStatus;
use keel_core::domain::workflow::{DEFAULT_WORKFLOW, Workflow};
use tracing::{debug, info, warn};

use crate::config::WorkflowConfig;
use crate::repository::{ResourceStore, patch_activity};
use crate::service::dedup::DedupGate;
use crate::service::promotion::{PromotionRequest, Promoter};
use crate::service::promotion_poller::PromotionPoller;
use crate::watch::ResourceEvent;

pub struct WorkflowEngine {
    store: Arc<dyn ResourceStore>,
    promoter: Arc<dyn Promoter>,
    poller: PromotionPoller,
    config: WorkflowConfig,
    dry_run: bool,
    workflows: HashMap<String, Workflow>,
    gate: DedupGate,
    /// Pull requests opened for an activity and environment that the
    /// activity does not show yet
    opened: HashMap<(String, String), String>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        promoter: Arc<dyn Promoter>,
        poller: PromotionPoller,
        config: WorkflowConfig,
        dry_run: bool,
    ) -> Self {
        Self {
            store,
            promoter,
            poller,
            config,
            dry_run,
            workflows: HashMap::new(),
            gate: DedupGate::new(),
            opened: HashMap::new(),
        }
    }

    pub async fn handle(&mut self, event: ResourceEvent) {
        match event {
            ResourceEvent::ActivityChanged(activity) => self.on_activity(activity).await,
            ResourceEvent::ActivityDeleted(name) => self.forget(&name),
            ResourceEvent::WorkflowChanged(workflow) => self.on_workflow(workflow),
            ResourceEvent::WorkflowDeleted(name) => self.on_workflow_deleted(&name),
            ResourceEvent::PodChanged(_) | ResourceEvent::PipelineRunChanged(_) => {}
        }
    }

    pub fn on_workflow(&mut self, workflow: Workflow) {
        debug!(workflow = %workflow.name(), "Caching workflow");
        self.workflows.insert(workflow.name().to_string(), workflow);
    }

    pub fn on_workflow_deleted(&mut self, name: &str) {
        self.workflows.remove(name);
    }

    fn forget(&mut self, name: &str) {
        self.gate.forget(name);
        self.opened.retain(|(activity, _), _| activity != name);
    }

    pub async fn on_activity(&mut self, activity: PipelineActivity) {
        let name = activity.name().to_string();
        let spec = &activity.spec;
        if spec.git_repository.is_empty()
            || spec.version.is_empty()
            || spec.build.is_empty()
            || spec.pipeline.is_empty()
        {
            debug!(activity = %name, "Activity not released yet, ignoring");
            self.forget(&name);
            return;
        }
        if spec.workflow.is_empty() {
            if !activity.has_active_promotion() {
                self.forget(&name);
            }
            return;
        }
        if spec.workflow_status.is_terminated() {
            return;
        }

        let Some(workflow) = self.resolve_workflow(&spec.workflow).await else {
            warn!(activity = %name, workflow = %spec.workflow, "Unknown workflow");
            return;
        };
        if !self.config.is_release_branch(&spec.git_branch) {
            debug!(activity = %name, branch = %spec.git_branch, "Not a release branch, ignoring");
            self.forget(&name);
            return;
        }
        if !self
            .gate
            .is_newest(&activity, self.store.as_ref(), self.dry_run)
            .await
        {
            self.forget(&name);
            return;
        }
        self.gate.remember(activity.clone());

        let mut activity = activity;
        for step in &workflow.spec.steps {
            let Some(environment) = step.environment() else {
                continue;
            };
            let result = if let Some(url) = self.unrecorded_pull_request(&activity, environment) {
                debug!(activity = %name, environment, url = %url, "Recording opened promotion");
                self.record(&name, environment, &url).await
            } else {
                if !needs_promotion(&activity, environment) {
                    continue;
                }
                if !step.can_execute(&activity) {
                    debug!(activity = %name, environment, "Promotion preconditions not met");
                    continue;
                }
                self.promote(&activity, environment).await
            };
            match result {
                Ok(Some(updated)) => {
                    self.gate.remember(updated.clone());
                    activity = updated;
                }
                Ok(None) => {}
                Err(e) => warn!(
                    activity = %name,
                    environment,
                    version = %activity.spec.version,
                    error = %format!("{e:#}"),
                    "Promotion failed"
                ),
            }
        }

        if workflow.is_complete_for(&activity) {
            self.complete(&activity).await;
        }
    }

    /// URL of a pull request this engine opened that the activity does not
    /// record yet, e.g. because the write after opening it failed
    fn unrecorded_pull_request(&mut self, activity: &PipelineActivity, environment: &str) -> Option<String> {
        let key = (activity.name().to_string(), environment.to_string());
        let recorded = activity
            .promote(environment)
            .is_some_and(|promote| promote.pull_request_url().is_some());
        if recorded {
            self.opened.remove(&key);
            return None;
        }
        self.opened.get(&key).cloned()
    }

    async fn promote(
        &mut self,
        activity: &PipelineActivity,
        environment: &str,
    ) -> Result<Option<PipelineActivity>> {
        let request = PromotionRequest::for_activity(activity, environment);
        if self.dry_run {
            info!(
                activity = %request.activity,
                environment,
                version = %request.version,
                "Dry run: would promote"
            );
            return Ok(None);
        }

        let outcome = self.promoter.promote(&request).await?;
        self.opened.insert(
            (request.activity.clone(), environment.to_string()),
            outcome.pull_request_url.clone(),
        );
        self.record(&request.activity, environment, &outcome.pull_request_url)
            .await
    }

    /// Writes an opened pull request onto the activity, retrying store errors
    async fn record(&self, name: &str, environment: &str, url: &str) -> Result<Option<PipelineActivity>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = patch_activity(self.store.as_ref(), name, |a| {
                let now = Utc::now();
                a.get_or_create_promote(environment, now)
                    .start_pull_request(url, now);
                if !a.spec.workflow_status.is_terminated() {
                    a.spec.workflow_status = ActivityStatus::Running;
                }
            })
            .await;
            match result {
                Ok(updated) => return Ok(updated),
                Err(e) if attempt < self.config.retry_attempts => {
                    warn!(
                        activity = %name,
                        environment,
                        attempt,
                        error = %e,
                        "Failed to record promotion, retrying in {:?}",
                        self.config.retry_interval
                    );
                    tokio::time::sleep(self.config.retry_interval).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to record promotion of {name} after {attempt} attempts")
                    });
                }
            }
        }
    }

    async fn complete(&mut self, activity: &PipelineActivity) {
        let spec = &activity.spec;
        if spec.status == ActivityStatus::Succeeded && spec.workflow_status == ActivityStatus::Succeeded {
            return;
        }
        info!(activity = %activity.name(), version = %spec.version, "Workflow complete");
        if self.dry_run {
            return;
        }
        let result = patch_activity(self.store.as_ref(), activity.name(), |a| {
            a.spec.status = ActivityStatus::Succeeded;
            a.spec.workflow_status = ActivityStatus::Succeeded;
        })
        .await;
        match result {
            Ok(Some(updated)) => self.gate.remember(updated),
            Ok(None) => {}
            Err(e) => warn!(activity = %activity.name(), error = %e, "Failed to complete workflow"),
        }
    }

    /// Looks a workflow up, reloading the cache and synthesizing the default
    /// workflow when needed
    async fn resolve_workflow(&mut self, name: &str) -> Option<Workflow> {
        if let Some(workflow) = self.workflows.get(name) {
            return Some(workflow.clone());
        }

        match self.store.list_workflows().await {
            Ok(workflows) => {
                for workflow in workflows {
                    self.workflows.insert(workflow.name().to_string(), workflow);
                }
            }
            Err(e) => warn!(error = %e, "Failed to reload workflows"),
        }
        if let Some(workflow) = self.workflows.get(name) {
            return Some(workflow.clone());
        }
        if name != DEFAULT_WORKFLOW {
            return None;
        }

        let environments = match self.store.list_environments().await {
            Ok(environments) => environments,
            Err(e) => {
                warn!(error = %e, "Failed to list environments for the default workflow");
                return None;
            }
        };
        let workflow = Workflow::default_for(&environments, &self.config.default_environment);
        info!(
            environments = ?workflow.promote_environments().collect::<Vec<_>>(),
            "Synthesized default workflow"
        );
        if !self.dry_run {
            if let Err(e) = self.store.create_workflow(&workflow).await {
                warn!(error = %e, "Failed to persist the default workflow");
            }
        }
        self.workflows
            .insert(workflow.name().to_string(), workflow.clone());
        Some(workflow)
    }

    /// Runs one promotion poll cycle
    pub async fn poll_promotions(&mut self) {
        match self.poller.poll(&mut self.gate).await {
            Ok(0) => debug!("No open promotions"),
            Ok(polled) => debug!(polled, "Polled promotions"),
            Err(e) => warn!(error = %format!("{e:#}"), "Promotion poll failed"),
        }
    }

    pub fn cached_activities(&self) -> usize {
        self.gate.tracked()
    }
}

/// A promotion is opened at most once per environment
fn needs_promotion(activity: &PipelineActivity, environment: &str) -> bool {
    match activity.promote(environment) {
        Some(promote) => promote.pull_request_url().is_none() && !promote.core.status.is_terminated(),
        None => true,
    }
}
