//! Superseded build detection
//!
//! Only the newest build of a pipeline may promote. The gate caches the
//! activities it has seen per pipeline key and aborts older builds as soon as
//! a newer one shows up.

use std::collections::HashMap;

use chrono::Utc;
use keel_core::domain::activity::PipelineActivity;
use keel_core::naming::is_newer_build;
use tracing::{info, warn};

use crate::repository::{ResourceStore, patch_activity};

/// Workflow message of an activity replaced by a newer build
pub const SUPERSEDED_MESSAGE: &str = "superseded";

#[derive(Debug, Default)]
pub struct DedupGate {
    pipelines: HashMap<String, PipelineActivity>,
}

impl DedupGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&mut self, activity: PipelineActivity) {
        self.pipelines.insert(activity.name().to_string(), activity);
    }

    pub fn forget(&mut self, name: &str) {
        self.pipelines.remove(name);
    }

    /// Number of activities currently cached
    pub fn tracked(&self) -> usize {
        self.pipelines.len()
    }

    /// Returns true if `activity` is the newest build of its pipeline
    ///
    /// Older cached builds of the same pipeline are aborted and evicted. An
    /// activity that is not the newest is aborted and evicted itself.
    pub async fn is_newest(
        &mut self,
        activity: &PipelineActivity,
        store: &dyn ResourceStore,
        dry_run: bool,
    ) -> bool {
        let key = activity.pipeline_key();
        let build = activity.spec.build.as_str();

        let mut newest = true;
        let mut superseded = Vec::new();
        for (name, cached) in &self.pipelines {
            if name == activity.name()
                || cached.pipeline_key() != key
                || cached.spec.build == build
            {
                continue;
            }
            if is_newer_build(&cached.spec.build, build) {
                newest = false;
            } else if is_newer_build(build, &cached.spec.build) {
                superseded.push(name.clone());
            }
        }

        for name in superseded {
            self.pipelines.remove(&name);
            abort(store, &name, dry_run).await;
        }
        if !newest {
            self.pipelines.remove(activity.name());
            abort(store, activity.name(), dry_run).await;
        }
        newest
    }
}

async fn abort(store: &dyn ResourceStore, name: &str, dry_run: bool) {
    if dry_run {
        info!(activity = %name, "Dry run: would abort superseded activity");
        return;
    }
    let now = Utc::now();
    let result = patch_activity(store, name, |activity| {
        if activity.mark_aborted(SUPERSEDED_MESSAGE) && activity.spec.completed_timestamp.is_none() {
            activity.spec.completed_timestamp = Some(now);
        }
    })
    .await;
    match result {
        Ok(Some(_)) => info!(activity = %name, "Aborted superseded activity"),
        Ok(None) => {}
        Err(e) => warn!(activity = %name, error = %e, "Failed to abort superseded activity"),
    }
}
