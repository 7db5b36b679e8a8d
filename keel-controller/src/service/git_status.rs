//! Commit status reporting
//!
//! The pipeline status of an activity is mirrored to its last commit on the
//! git provider. The last reported state is kept in an annotation so every
//! state is reported once, and nothing is reported after a terminal one.

use std::sync::Arc;

use keel_client::GitProvider;
use keel_core::domain::activity::{GIT_REPORT_STATE_ANNOTATION, PipelineActivity};
use keel_core::domain::status::ActivityStatus;
use keel_core::dto::git::CommitStatusInfo;
use tracing::{debug, info, warn};

/// Provider state for a pipeline status
pub fn to_scm_state(status: ActivityStatus) -> &'static str {
    match status {
        ActivityStatus::Succeeded => "success",
        ActivityStatus::Running | ActivityStatus::Pending => "pending",
        ActivityStatus::Error => "error",
        _ => "failure",
    }
}

fn is_terminal_report(state: &str) -> bool {
    matches!(
        ActivityStatus::from(state),
        ActivityStatus::Succeeded | ActivityStatus::Failed | ActivityStatus::Aborted
    )
}

/// Substitutes activity fields into a target URL template
pub fn render_target_url(template: &str, activity: &PipelineActivity, context: &str) -> String {
    let spec = &activity.spec;
    template
        .replace("{owner}", &spec.git_owner)
        .replace("{repository}", &spec.git_repository)
        .replace("{branch}", &spec.git_branch)
        .replace("{build}", &spec.build)
        .replace("{context}", context)
}

pub struct GitStatusReporter {
    git: Arc<dyn GitProvider>,
    default_context: String,
    target_url_template: String,
}

impl GitStatusReporter {
    pub fn new(
        git: Arc<dyn GitProvider>,
        default_context: impl Into<String>,
        target_url_template: impl Into<String>,
    ) -> Self {
        Self {
            git,
            default_context: default_context.into(),
            target_url_template: target_url_template.into(),
        }
    }

    /// Reports the activity status, recording it in the annotation on success
    ///
    /// Returns true if a status was posted.
    pub async fn report(&self, activity: &mut PipelineActivity) -> bool {
        let spec = &activity.spec;
        if spec.git_url.is_empty()
            || spec.last_commit_sha.is_empty()
            || spec.git_owner.is_empty()
            || spec.git_repository.is_empty()
        {
            debug!(activity = %activity.name(), "Missing git metadata, not reporting status");
            return false;
        }
        if spec.status == ActivityStatus::None {
            return false;
        }

        let last_reported = activity.metadata.annotation(GIT_REPORT_STATE_ANNOTATION);
        let status = spec.status.as_str();
        if let Some(last) = last_reported {
            if last == status || is_terminal_report(last) {
                return false;
            }
        }

        let context = if spec.context.is_empty() {
            self.default_context.as_str()
        } else {
            spec.context.as_str()
        };
        let commit_status = CommitStatusInfo {
            state: to_scm_state(spec.status).to_string(),
            target_url: render_target_url(&self.target_url_template, activity, context),
            context: context.to_string(),
            description: format!("Pipeline {status}"),
            ..Default::default()
        };

        let result = self
            .git
            .update_commit_status(
                &spec.git_owner,
                &spec.git_repository,
                &spec.last_commit_sha,
                &commit_status,
            )
            .await;
        match result {
            Ok(()) => {
                info!(
                    activity = %activity.name(),
                    owner = %spec.git_owner,
                    repository = %spec.git_repository,
                    sha = %spec.last_commit_sha,
                    state = %commit_status.state,
                    "Reported commit status"
                );
                let status = status.to_string();
                activity
                    .metadata
                    .annotations
                    .insert(GIT_REPORT_STATE_ANNOTATION.to_string(), status);
                true
            }
            Err(e) => {
                warn!(
                    activity = %activity.name(),
                    owner = %spec.git_owner,
                    repository = %spec.git_repository,
                    sha = %spec.last_commit_sha,
                    error = %e,
                    "Failed to report commit status"
                );
                false
            }
        }
    }
}
