//! Build status reconciliation
//!
//! Every pod or pipeline-run event is folded into the activity it reports
//! to. The whole status is recomputed from the snapshot each time, so
//! reprocessing an event is harmless and a lost update converges on the next
//! one.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use keel_core::domain::activity::{GIT_REPORT_STATE_ANNOTATION, PipelineActivity};
use keel_core::domain::pod::PodSnapshot;
use keel_core::domain::run::PipelineRunInfo;
use keel_core::key::ActivityKey;
use keel_core::status::{apply_pod, apply_run, rollup_pipeline};
use tracing::{debug, info, warn};

use crate::repository::{ResourceStore, RunSource};
use crate::service::completion::CompletionEffects;
use crate::service::git_status::GitStatusReporter;
use crate::watch::{EventHandler, ResourceEvent};

/// What an activity is being reconciled from
#[derive(Debug, Clone, Copy)]
pub enum BuildSnapshot<'a> {
    /// A pod that is not part of a pipeline run
    Pod(&'a PodSnapshot),
    Run(&'a PipelineRunInfo),
}

impl<'a> BuildSnapshot<'a> {
    pub fn pods(&self) -> Vec<&'a PodSnapshot> {
        match self {
            BuildSnapshot::Pod(pod) => vec![*pod],
            BuildSnapshot::Run(run) => run.pods().collect(),
        }
    }
}

/// Applies the snapshot to the activity, returning true on the transition
/// into a terminal status
pub fn update_status(activity: &mut PipelineActivity, snapshot: BuildSnapshot<'_>) -> bool {
    let now = Utc::now();
    match snapshot {
        BuildSnapshot::Pod(pod) => {
            let terminated = apply_pod(activity, pod);
            rollup_pipeline(activity, terminated, now)
        }
        BuildSnapshot::Run(run) => {
            apply_run(activity, run);
            rollup_pipeline(activity, false, now)
        }
    }
}

/// Result of one reconciliation
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub activity: PipelineActivity,
    pub changed: bool,
}

/// Completion outcomes kept across retries of the same event
#[derive(Debug, Default)]
struct Carried {
    build_logs_url: Option<String>,
    reported_state: Option<String>,
}

pub struct BuildStatusReconciler {
    store: Arc<dyn ResourceStore>,
    completion: CompletionEffects,
    reporter: Option<GitStatusReporter>,
    retry_interval: Duration,
    retry_attempts: u32,
    dry_run: bool,
}

impl BuildStatusReconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        completion: CompletionEffects,
        reporter: Option<GitStatusReporter>,
        retry_interval: Duration,
        retry_attempts: u32,
        dry_run: bool,
    ) -> Self {
        Self {
            store,
            completion,
            reporter,
            retry_interval,
            retry_attempts: retry_attempts.max(1),
            dry_run,
        }
    }

    /// Reconciles the activity identified by `key`, retrying on store errors
    pub async fn reconcile(&self, key: &ActivityKey, snapshot: BuildSnapshot<'_>) -> Result<Reconciled> {
        let mut carried = Carried::default();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.reconcile_once(key, snapshot, &mut carried).await {
                Ok(reconciled) => return Ok(reconciled),
                Err(e) if attempt < self.retry_attempts => {
                    warn!(
                        activity = %key.name,
                        attempt,
                        error = %format!("{e:#}"),
                        "Reconcile failed, retrying in {:?}",
                        self.retry_interval
                    );
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Giving up on activity {} after {attempt} attempts", key.name)
                    });
                }
            }
        }
    }

    async fn get_or_create(&self, key: &ActivityKey) -> Result<PipelineActivity> {
        if let Some(activity) = self
            .store
            .get_activity(&key.name)
            .await
            .with_context(|| format!("Failed to load activity {}", key.name))?
        {
            return Ok(activity);
        }

        let activity = key.new_activity();
        if self.dry_run {
            info!(activity = %key.name, "Dry run: would create activity");
            return Ok(activity);
        }
        info!(activity = %key.name, pipeline = %key.pipeline, build = %key.build, "Creating activity");
        self.store
            .create_activity(&activity)
            .await
            .with_context(|| format!("Failed to create activity {}", key.name))
    }

    async fn reconcile_once(
        &self,
        key: &ActivityKey,
        snapshot: BuildSnapshot<'_>,
        carried: &mut Carried,
    ) -> Result<Reconciled> {
        let mut activity = self.get_or_create(key).await?;
        let before = activity.snapshot()?;

        key.apply(&mut activity);
        if update_status(&mut activity, snapshot) {
            self.log_completion(&activity);
            if let Some(url) = &carried.build_logs_url {
                activity.spec.build_logs_url = url.clone();
            }
            self.completion.on_completed(&mut activity, &snapshot.pods()).await;
            if !activity.spec.build_logs_url.is_empty() {
                carried.build_logs_url = Some(activity.spec.build_logs_url.clone());
            }
        }

        if let Some(reporter) = &self.reporter {
            if let Some(state) = &carried.reported_state {
                activity
                    .metadata
                    .annotations
                    .insert(GIT_REPORT_STATE_ANNOTATION.to_string(), state.clone());
            }
            if !self.dry_run && reporter.report(&mut activity).await {
                carried.reported_state = activity
                    .metadata
                    .annotation(GIT_REPORT_STATE_ANNOTATION)
                    .map(str::to_string);
            }
        }

        let changed = activity.snapshot()? != before;
        if changed && !self.dry_run {
            activity = self
                .store
                .update_activity(&activity)
                .await
                .with_context(|| format!("Failed to update activity {}", key.name))?;
            debug!(activity = %key.name, status = %activity.spec.status, "Updated activity");
        }

        Ok(Reconciled { activity, changed })
    }

    fn log_completion(&self, activity: &PipelineActivity) {
        let spec = &activity.spec;
        let duration = match (spec.started_timestamp, spec.completed_timestamp) {
            (Some(started), Some(completed)) => format!("{}s", (completed - started).num_seconds()),
            _ => "unknown".to_string(),
        };
        info!(
            activity = %activity.name(),
            status = %spec.status,
            owner = %spec.git_owner,
            repository = %spec.git_repository,
            sha = %spec.last_commit_sha,
            build = %spec.build,
            duration = %duration,
            stages = %activity.stage_summary(),
            "Pipeline completed"
        );
    }
}

/// Routes pod and pipeline-run events into the reconciler
pub struct BuildEventHandler {
    reconciler: BuildStatusReconciler,
    runs: Arc<dyn RunSource>,
}

impl BuildEventHandler {
    pub fn new(reconciler: BuildStatusReconciler, runs: Arc<dyn RunSource>) -> Self {
        Self { reconciler, runs }
    }

    async fn on_pod(&self, pod: &PodSnapshot) {
        let Some(key) = ActivityKey::from_pod(pod) else {
            debug!(pod = %pod.name, "Pod carries no git metadata, ignoring");
            return;
        };
        self.finish(&key, self.reconciler.reconcile(&key, BuildSnapshot::Pod(pod)).await);
    }

    async fn on_pipeline_run(&self, name: &str) {
        let run = match self.runs.pipeline_run(name).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                debug!(run = %name, "Pipeline run is gone, ignoring");
                return;
            }
            Err(e) => {
                warn!(run = %name, error = %e, "Failed to load pipeline run");
                return;
            }
        };
        let Some(key) = ActivityKey::from_run(&run) else {
            debug!(run = %name, "Pipeline run carries no git metadata, ignoring");
            return;
        };
        self.finish(&key, self.reconciler.reconcile(&key, BuildSnapshot::Run(&run)).await);
    }

    fn finish(&self, key: &ActivityKey, result: Result<Reconciled>) {
        match result {
            Ok(reconciled) if reconciled.changed => {
                debug!(activity = %key.name, status = %reconciled.activity.spec.status, "Activity reconciled");
            }
            Ok(_) => {}
            Err(e) => warn!(activity = %key.name, error = %format!("{e:#}"), "Dropping build event"),
        }
    }
}

#[async_trait]
impl EventHandler for BuildEventHandler {
    async fn handle(&self, event: ResourceEvent) {
        match event {
            ResourceEvent::PodChanged(pod) => match pod.pipeline_run() {
                Some(run) => {
                    let run = run.to_string();
                    self.on_pipeline_run(&run).await;
                }
                None => self.on_pod(&pod).await,
            },
            ResourceEvent::PipelineRunChanged(name) => self.on_pipeline_run(&name).await,
            _ => {}
        }
    }
}
