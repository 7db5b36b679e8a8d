//! Pod snapshots
//!
//! A runtime-neutral view of a build pod: its labels and, for every container,
//! the arguments, environment and lifecycle state the status logic needs.
//! Container statuses are merged into their containers in container order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label naming the build a pod belongs to, in lookup order
pub const BUILD_NAME_LABELS: [&str; 3] = [
    "build.knative.dev/buildName",
    "build-name",
    PIPELINE_RUN_LABEL,
];

/// Label linking a pod to its pipeline run
pub const PIPELINE_RUN_LABEL: &str = "tekton.dev/pipelineRun";

/// Label naming the stage a pipeline-run pod executes
pub const STAGE_NAME_LABEL: &str = "jenkins.io/task-stage-name";

/// Label discriminating parallel pipelines of one branch
pub const CONTEXT_LABEL: &str = "context";

/// Trailing placeholder container that is not a step
const NOP_CONTAINER: &str = "nop";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSnapshot {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub init_containers: Vec<ContainerSnapshot>,
    pub containers: Vec<ContainerSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub name: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub state: ContainerState,
}

/// Lifecycle state of one container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    #[default]
    Waiting,
    Running {
        started_at: Option<DateTime<Utc>>,
    },
    Terminated {
        exit_code: i32,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    },
}

impl ContainerState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Waiting => None,
            Self::Running { started_at } | Self::Terminated { started_at, .. } => *started_at,
        }
    }
}

impl ContainerSnapshot {
    pub fn named(name: impl Into<String>, state: ContainerState) -> Self {
        Self {
            name: name.into(),
            state,
            ..Default::default()
        }
    }

    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
            .filter(|value| !value.is_empty())
    }

    /// Value following `flag` in the container arguments
    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|arg| arg == flag)
            .and_then(|index| self.args.get(index + 1))
            .map(String::as_str)
    }
}

impl PodSnapshot {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn build_name(&self) -> Option<&str> {
        BUILD_NAME_LABELS.iter().find_map(|key| self.label(key))
    }

    pub fn pipeline_run(&self) -> Option<&str> {
        self.label(PIPELINE_RUN_LABEL)
    }

    pub fn stage_name(&self) -> Option<&str> {
        self.label(STAGE_NAME_LABEL)
    }

    /// Containers that represent steps, in execution order
    ///
    /// Init containers run first; a trailing `nop` container is dropped.
    pub fn step_containers(&self) -> Vec<&ContainerSnapshot> {
        let mut containers: Vec<&ContainerSnapshot> = self.init_containers.iter().collect();
        let regular = match self.containers.split_last() {
            Some((last, rest)) if last.name == NOP_CONTAINER => rest,
            _ => self.containers.as_slice(),
        };
        containers.extend(regular);
        containers
    }

    pub fn all_containers(&self) -> impl Iterator<Item = &ContainerSnapshot> {
        self.init_containers.iter().chain(self.containers.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_containers_include_init_and_drop_trailing_nop() {
        let pod = PodSnapshot {
            name: "p".to_string(),
            init_containers: vec![ContainerSnapshot::named("git-source", ContainerState::Waiting)],
            containers: vec![
                ContainerSnapshot::named("step-build", ContainerState::Waiting),
                ContainerSnapshot::named("nop", ContainerState::Waiting),
            ],
            ..Default::default()
        };
        let names: Vec<&str> = pod
            .step_containers()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["git-source", "step-build"]);
    }

    #[test]
    fn test_build_name_label_precedence() {
        let mut pod = PodSnapshot::default();
        pod.labels
            .insert(PIPELINE_RUN_LABEL.to_string(), "run-1".to_string());
        assert_eq!(pod.build_name(), Some("run-1"));

        pod.labels
            .insert("build-name".to_string(), "build-2".to_string());
        assert_eq!(pod.build_name(), Some("build-2"));
    }

    #[test]
    fn test_arg_value_reads_following_argument() {
        let container = ContainerSnapshot {
            args: vec![
                "-url".to_string(),
                "https://github.com/org/repo".to_string(),
                "-revision".to_string(),
            ],
            ..Default::default()
        };
        assert_eq!(
            container.arg_value("-url"),
            Some("https://github.com/org/repo")
        );
        assert_eq!(container.arg_value("-revision"), None);
    }
}
