//! PipelineActivity domain types
//!
//! A PipelineActivity is the persisted status record of one pipeline execution:
//! identity and git metadata, the pipeline-level status, and an ordered list of
//! steps. Each step is either a build stage (with leaf steps derived from
//! containers) or a promotion into an environment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::meta::ObjectMeta;
use super::status::ActivityStatus;

/// Annotation recording the last status reported to the git provider
pub const GIT_REPORT_STATE_ANNOTATION: &str = "keel.io/git-report-state";

/// Stage inserted ahead of the first promotion when nothing else has run
pub const RELEASE_STAGE_NAME: &str = "Release";

/// A single pipeline execution record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineActivity {
    pub metadata: ObjectMeta,
    pub spec: PipelineActivitySpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineActivitySpec {
    /// `owner/repository/branch`
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pipeline: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub build: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    pub status: ActivityStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<ActivityStep>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub build_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub build_logs_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub git_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub git_repository: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub git_owner: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub git_branch: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pull_title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_commit_sha: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_commit_message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub workflow: String,
    pub workflow_status: ActivityStatus,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub workflow_message: String,
    /// Discriminates parallel pipelines of the same branch
    #[serde(skip_serializing_if = "String::is_empty")]
    pub context: String,
}

/// Fields shared by every kind of step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreActivityStep {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub status: ActivityStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_timestamp: Option<DateTime<Utc>>,
}

impl CoreActivityStep {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A build stage and the leaf steps of its pod
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageActivityStep {
    #[serde(flatten)]
    pub core: CoreActivityStep,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<CoreActivityStep>,
}

impl StageActivityStep {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            core: CoreActivityStep::named(name),
            steps: Vec::new(),
        }
    }
}

/// Promotion of the built version into one environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromoteActivityStep {
    #[serde(flatten)]
    pub core: CoreActivityStep,
    pub environment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PromotePullRequestStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<PromoteUpdateStep>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub application_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromotePullRequestStep {
    #[serde(flatten)]
    pub core: CoreActivityStep,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pull_request_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub merge_commit_sha: String,
}

/// Waits for the environment pipeline triggered by the merge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromoteUpdateStep {
    #[serde(flatten)]
    pub core: CoreActivityStep,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<GitStatus>,
}

/// Latest state of one commit check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitStatus {
    pub url: String,
    pub status: String,
}

/// One entry of [`PipelineActivitySpec::steps`]
///
/// Stored as `{kind, stage}` or `{kind, promote}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub enum ActivityStep {
    Stage(StageActivityStep),
    Promote(PromoteActivityStep),
}

impl ActivityStep {
    pub fn core(&self) -> &CoreActivityStep {
        match self {
            Self::Stage(stage) => &stage.core,
            Self::Promote(promote) => &promote.core,
        }
    }

    pub fn as_stage(&self) -> Option<&StageActivityStep> {
        match self {
            Self::Stage(stage) => Some(stage),
            Self::Promote(_) => None,
        }
    }

    pub fn as_promote(&self) -> Option<&PromoteActivityStep> {
        match self {
            Self::Promote(promote) => Some(promote),
            Self::Stage(_) => None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawStep {
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<StageActivityStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    promote: Option<PromoteActivityStep>,
}

impl TryFrom<RawStep> for ActivityStep {
    type Error = String;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        match raw.kind.as_str() {
            "Stage" => raw
                .stage
                .map(Self::Stage)
                .ok_or_else(|| "Stage step has no stage body".to_string()),
            "Promote" => raw
                .promote
                .map(Self::Promote)
                .ok_or_else(|| "Promote step has no promote body".to_string()),
            other => Err(format!("unsupported step kind '{other}'")),
        }
    }
}

impl From<ActivityStep> for RawStep {
    fn from(step: ActivityStep) -> Self {
        match step {
            ActivityStep::Stage(stage) => Self {
                kind: "Stage".to_string(),
                stage: Some(stage),
                promote: None,
            },
            ActivityStep::Promote(promote) => Self {
                kind: "Promote".to_string(),
                stage: None,
                promote: Some(promote),
            },
        }
    }
}

impl PipelineActivity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec: PipelineActivitySpec::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Canonical serialization used to detect changes before writing
    pub fn snapshot(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Key shared by every build of the same logical pipeline
    pub fn pipeline_key(&self) -> String {
        if self.spec.context.is_empty() {
            self.spec.pipeline.clone()
        } else {
            format!("{}/{}", self.spec.pipeline, self.spec.context)
        }
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageActivityStep> {
        self.spec.steps.iter().filter_map(ActivityStep::as_stage)
    }

    pub fn stage(&self, name: &str) -> Option<&StageActivityStep> {
        self.stages().find(|stage| stage.core.name == name)
    }

    pub fn stages_mut(&mut self) -> impl Iterator<Item = &mut StageActivityStep> {
        self.spec.steps.iter_mut().filter_map(|step| match step {
            ActivityStep::Stage(stage) => Some(stage),
            ActivityStep::Promote(_) => None,
        })
    }

    /// Returns the named stage, appending an empty one if it does not exist yet
    pub fn get_or_create_stage(&mut self, name: &str) -> &mut StageActivityStep {
        let position = self
            .spec
            .steps
            .iter()
            .position(|step| matches!(step, ActivityStep::Stage(stage) if stage.core.name == name));
        let index = match position {
            Some(index) => index,
            None => {
                self.spec
                    .steps
                    .push(ActivityStep::Stage(StageActivityStep::named(name)));
                self.spec.steps.len() - 1
            }
        };
        match &mut self.spec.steps[index] {
            ActivityStep::Stage(stage) => stage,
            ActivityStep::Promote(_) => unreachable!("index points at a stage"),
        }
    }

    pub fn promotes(&self) -> impl Iterator<Item = &PromoteActivityStep> {
        self.spec.steps.iter().filter_map(ActivityStep::as_promote)
    }

    pub fn promote(&self, environment: &str) -> Option<&PromoteActivityStep> {
        self.promotes()
            .find(|promote| promote.environment == environment)
    }

    pub fn promote_mut(&mut self, environment: &str) -> Option<&mut PromoteActivityStep> {
        self.spec.steps.iter_mut().find_map(|step| match step {
            ActivityStep::Promote(promote) if promote.environment == environment => Some(promote),
            _ => None,
        })
    }

    /// Status of the promotion into `environment`, `None` if there is none
    pub fn promote_status(&self, environment: &str) -> ActivityStatus {
        self.promote(environment)
            .map(|promote| promote.core.status)
            .unwrap_or_default()
    }

    /// True while any promotion is still pending or running
    pub fn has_active_promotion(&self) -> bool {
        self.promotes().any(|promote| promote.core.status.is_active())
    }

    /// Returns the promotion into `environment`, creating it if needed
    ///
    /// An activity without any steps first gets a succeeded release stage so
    /// the promotion is never the only record of the run.
    pub fn get_or_create_promote(
        &mut self,
        environment: &str,
        now: DateTime<Utc>,
    ) -> &mut PromoteActivityStep {
        if self.promote(environment).is_none() {
            if self.spec.steps.is_empty() {
                let mut release = StageActivityStep::named(RELEASE_STAGE_NAME);
                release.core.status = ActivityStatus::Succeeded;
                release.core.started_timestamp = self.spec.started_timestamp.or(Some(now));
                release.core.completed_timestamp = self.spec.completed_timestamp.or(Some(now));
                self.spec.steps.push(ActivityStep::Stage(release));
            }
            self.spec
                .steps
                .push(ActivityStep::Promote(PromoteActivityStep {
                    core: CoreActivityStep {
                        name: format!("Promote: {environment}"),
                        started_timestamp: Some(now),
                        ..Default::default()
                    },
                    environment: environment.to_string(),
                    ..Default::default()
                }));
        }
        let index = self
            .spec
            .steps
            .iter()
            .position(|step| matches!(step, ActivityStep::Promote(p) if p.environment == environment))
            .unwrap_or(self.spec.steps.len() - 1);
        match &mut self.spec.steps[index] {
            ActivityStep::Promote(promote) => promote,
            ActivityStep::Stage(_) => unreachable!("index points at a promotion"),
        }
    }

    /// Marks the activity and its workflow aborted, returning true if anything changed
    pub fn mark_aborted(&mut self, message: &str) -> bool {
        let before = (
            self.spec.status,
            self.spec.workflow_status,
            self.spec.workflow_message.clone(),
        );
        self.spec.status = ActivityStatus::Aborted;
        self.spec.workflow_status = ActivityStatus::Aborted;
        self.spec.workflow_message = message.to_string();
        before
            != (
                self.spec.status,
                self.spec.workflow_status,
                self.spec.workflow_message.clone(),
            )
    }

    /// One-line `name=status` summary of every stage, for completion logs
    pub fn stage_summary(&self) -> String {
        self.stages()
            .map(|stage| format!("{}={}", stage.core.name, stage.core.status))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl PromoteActivityStep {
    pub fn pull_request_url(&self) -> Option<&str> {
        self.pull_request
            .as_ref()
            .map(|pr| pr.pull_request_url.as_str())
            .filter(|url| !url.is_empty())
    }

    /// Records a freshly opened promotion pull request
    pub fn start_pull_request(&mut self, url: &str, now: DateTime<Utc>) {
        self.core.status = ActivityStatus::Running;
        self.core.started_timestamp.get_or_insert(now);
        let pr = self
            .pull_request
            .get_or_insert_with(|| PromotePullRequestStep {
                core: CoreActivityStep::named("Promote PR"),
                ..Default::default()
            });
        pr.core.status = ActivityStatus::Running;
        pr.core.started_timestamp.get_or_insert(now);
        pr.pull_request_url = url.to_string();
    }

    /// Marks the pull request merged
    pub fn complete_pull_request(&mut self, merge_sha: &str, now: DateTime<Utc>) {
        let pr = self
            .pull_request
            .get_or_insert_with(|| PromotePullRequestStep {
                core: CoreActivityStep::named("Promote PR"),
                ..Default::default()
            });
        pr.core.status = ActivityStatus::Succeeded;
        pr.core.completed_timestamp.get_or_insert(now);
        pr.merge_commit_sha = merge_sha.to_string();
    }

    /// Starts waiting for the environment pipeline
    pub fn start_update(&mut self, now: DateTime<Utc>) {
        let update = self.update.get_or_insert_with(|| PromoteUpdateStep {
            core: CoreActivityStep::named("Promote Update"),
            ..Default::default()
        });
        if !update.core.status.is_terminated() {
            update.core.status = ActivityStatus::Running;
        }
        update.core.started_timestamp.get_or_insert(now);
    }

    /// Marks the update, and with it the whole promotion, succeeded
    pub fn complete_update(&mut self, now: DateTime<Utc>) {
        self.start_update(now);
        if let Some(update) = self.update.as_mut() {
            update.core.status = ActivityStatus::Succeeded;
            update.core.completed_timestamp.get_or_insert(now);
        }
        if let Some(pr) = self.pull_request.as_mut() {
            if pr.core.status == ActivityStatus::None {
                pr.core.status = ActivityStatus::Succeeded;
            }
        }
        self.core.status = ActivityStatus::Succeeded;
        self.core.completed_timestamp.get_or_insert(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_steps_use_kind_tagged_shape() {
        let mut activity = PipelineActivity::new("org-repo-master-1");
        activity.get_or_create_stage("Build").core.status = ActivityStatus::Running;
        activity.get_or_create_promote("staging", ts(10));

        let value = serde_json::to_value(&activity).unwrap();
        let steps = value["spec"]["steps"].as_array().unwrap();
        assert_eq!(steps[0]["kind"], "Stage");
        assert_eq!(steps[0]["stage"]["name"], "Build");
        assert_eq!(steps[0]["stage"]["status"], "Running");
        assert_eq!(steps[1]["kind"], "Promote");
        assert_eq!(steps[1]["promote"]["environment"], "staging");

        let back: PipelineActivity = serde_json::from_value(value).unwrap();
        assert_eq!(back, activity);
    }

    #[test]
    fn test_unknown_step_kind_is_rejected() {
        let json = r#"{"metadata":{"name":"a"},"spec":{"steps":[{"kind":"Preview"}]}}"#;
        assert!(serde_json::from_str::<PipelineActivity>(json).is_err());
    }

    #[test]
    fn test_get_or_create_stage_reuses_existing() {
        let mut activity = PipelineActivity::new("a");
        activity.get_or_create_stage("Build").core.status = ActivityStatus::Running;
        activity.get_or_create_stage("Build");
        activity.get_or_create_stage("Test");

        assert_eq!(activity.stages().count(), 2);
        assert_eq!(
            activity.stage("Build").unwrap().core.status,
            ActivityStatus::Running
        );
    }

    #[test]
    fn test_first_promote_inserts_release_stage() {
        let mut activity = PipelineActivity::new("a");
        activity.get_or_create_promote("staging", ts(5));
        activity.get_or_create_promote("production", ts(6));

        assert_eq!(activity.spec.steps.len(), 3);
        let release = activity.stage(RELEASE_STAGE_NAME).unwrap();
        assert_eq!(release.core.status, ActivityStatus::Succeeded);
        assert_eq!(
            activity.promote("production").unwrap().core.started_timestamp,
            Some(ts(6))
        );
    }

    #[test]
    fn test_promotion_lifecycle() {
        let mut activity = PipelineActivity::new("a");
        let promote = activity.get_or_create_promote("staging", ts(1));
        promote.start_pull_request("https://github.com/org/env/pull/3", ts(2));
        assert_eq!(promote.core.status, ActivityStatus::Running);
        assert_eq!(
            promote.pull_request_url(),
            Some("https://github.com/org/env/pull/3")
        );

        promote.complete_pull_request("abc", ts(3));
        promote.start_update(ts(3));
        assert_eq!(
            promote.update.as_ref().unwrap().core.status,
            ActivityStatus::Running
        );

        promote.complete_update(ts(4));
        assert_eq!(promote.core.status, ActivityStatus::Succeeded);
        assert_eq!(promote.core.completed_timestamp, Some(ts(4)));
        assert_eq!(
            promote.pull_request.as_ref().unwrap().merge_commit_sha,
            "abc"
        );
        assert_eq!(activity.promote_status("staging"), ActivityStatus::Succeeded);
        assert!(!activity.has_active_promotion());
    }

    #[test]
    fn test_pipeline_key_includes_context() {
        let mut activity = PipelineActivity::new("a");
        activity.spec.pipeline = "org/repo/master".to_string();
        assert_eq!(activity.pipeline_key(), "org/repo/master");
        activity.spec.context = "lint".to_string();
        assert_eq!(activity.pipeline_key(), "org/repo/master/lint");
    }

    #[test]
    fn test_mark_aborted_reports_change_once() {
        let mut activity = PipelineActivity::new("a");
        assert!(activity.mark_aborted("superseded"));
        assert!(!activity.mark_aborted("superseded"));
        assert_eq!(activity.spec.workflow_status, ActivityStatus::Aborted);
    }
}
