//! Workflow domain types
//!
//! A workflow is an ordered list of promotion steps. A step may only execute
//! once every environment named in its preconditions has been promoted.

use serde::{Deserialize, Serialize};

use super::activity::PipelineActivity;
use super::environment::Environment;
use super::meta::ObjectMeta;
use super::status::ActivityStatus;

/// Workflow name resolved to a workflow synthesized from the environments
pub const DEFAULT_WORKFLOW: &str = "default";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Workflow {
    pub metadata: ObjectMeta,
    pub spec: WorkflowSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSpec {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pipeline: String,
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowStep {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub preconditions: WorkflowPreconditions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promote: Option<PromoteWorkflowStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowPreconditions {
    pub environments: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromoteWorkflowStep {
    pub environment: String,
}

impl Workflow {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Builds the default workflow
    ///
    /// Auto-promoting environments are chained in `order`, each waiting on the
    /// one before it. Without any, a single step promotes to `fallback`.
    pub fn default_for(environments: &[Environment], fallback: &str) -> Self {
        let mut auto: Vec<&Environment> = environments
            .iter()
            .filter(|env| env.is_auto_promote())
            .collect();
        auto.sort_by_key(|env| env.spec.order);

        let mut names: Vec<&str> = auto.iter().map(|env| env.name()).collect();
        if names.is_empty() {
            names.push(fallback);
        }

        let mut steps = Vec::with_capacity(names.len());
        let mut previous: Option<&str> = None;
        for name in names {
            steps.push(WorkflowStep::promote(name, previous.into_iter().collect()));
            previous = Some(name);
        }

        Self {
            metadata: ObjectMeta::named(DEFAULT_WORKFLOW),
            spec: WorkflowSpec {
                pipeline: String::new(),
                steps,
            },
        }
    }

    pub fn promote_environments(&self) -> impl Iterator<Item = &str> {
        self.spec.steps.iter().filter_map(WorkflowStep::environment)
    }

    /// True once every promotion of the workflow has succeeded
    pub fn is_complete_for(&self, activity: &PipelineActivity) -> bool {
        let mut environments = self.promote_environments().peekable();
        environments.peek().is_some()
            && environments
                .all(|env| activity.promote_status(env) == ActivityStatus::Succeeded)
    }
}

impl WorkflowStep {
    pub fn promote(environment: &str, preconditions: Vec<&str>) -> Self {
        Self {
            name: format!("promote-{environment}"),
            preconditions: WorkflowPreconditions {
                environments: preconditions.into_iter().map(str::to_string).collect(),
            },
            promote: Some(PromoteWorkflowStep {
                environment: environment.to_string(),
            }),
        }
    }

    pub fn environment(&self) -> Option<&str> {
        self.promote
            .as_ref()
            .map(|promote| promote.environment.as_str())
            .filter(|env| !env.is_empty())
    }

    /// Every precondition environment must already be promoted
    pub fn can_execute(&self, activity: &PipelineActivity) -> bool {
        self.preconditions
            .environments
            .iter()
            .all(|env| activity.promote_status(env) == ActivityStatus::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn environment(name: &str, strategy: &str, order: i32) -> Environment {
        let mut env = Environment::default();
        env.metadata.name = name.to_string();
        env.spec.promotion_strategy = strategy.to_string();
        env.spec.order = order;
        env
    }

    #[test]
    fn test_default_workflow_chains_auto_environments_by_order() {
        let envs = vec![
            environment("production", "Auto", 200),
            environment("dev", "Never", 0),
            environment("staging", "Auto", 100),
            environment("preview", "Manual", 50),
        ];
        let workflow = Workflow::default_for(&envs, "staging");

        assert_eq!(workflow.name(), DEFAULT_WORKFLOW);
        let targets: Vec<&str> = workflow.promote_environments().collect();
        assert_eq!(targets, vec!["staging", "production"]);
        assert!(workflow.spec.steps[0].preconditions.environments.is_empty());
        assert_eq!(
            workflow.spec.steps[1].preconditions.environments,
            vec!["staging".to_string()]
        );
    }

    #[test]
    fn test_default_workflow_falls_back_to_single_environment() {
        let workflow = Workflow::default_for(&[], "staging");
        let targets: Vec<&str> = workflow.promote_environments().collect();
        assert_eq!(targets, vec!["staging"]);
    }

    #[test]
    fn test_precondition_waits_for_succeeded() {
        let step = WorkflowStep::promote("staging", vec!["dev"]);
        let mut activity = PipelineActivity::new("a");
        assert!(!step.can_execute(&activity));

        activity.get_or_create_promote("dev", Utc::now()).core.status = ActivityStatus::Running;
        assert!(!step.can_execute(&activity));

        activity.promote_mut("dev").unwrap().core.status = ActivityStatus::Succeeded;
        assert!(step.can_execute(&activity));
    }

    #[test]
    fn test_is_complete_for_requires_every_promotion() {
        let workflow = Workflow::default_for(
            &[
                environment("staging", "Auto", 1),
                environment("production", "Auto", 2),
            ],
            "staging",
        );
        let mut activity = PipelineActivity::new("a");
        activity.get_or_create_promote("staging", Utc::now()).core.status =
            ActivityStatus::Succeeded;
        assert!(!workflow.is_complete_for(&activity));

        activity.get_or_create_promote("production", Utc::now()).core.status =
            ActivityStatus::Succeeded;
        assert!(workflow.is_complete_for(&activity));
    }
}
