//! Step status extraction
//!
//! All containers of a pod start together, but each step's command blocks until
//! the previous step has finished. Status and start time of a step therefore
//! depend on its predecessor as well as on its own container.

use chrono::{DateTime, Utc};

use crate::domain::activity::CoreActivityStep;
use crate::domain::pod::{ContainerState, PodSnapshot};
use crate::domain::status::ActivityStatus;
use crate::naming::step_title;

/// Steps derived from one pod
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedSteps {
    pub steps: Vec<CoreActivityStep>,
    /// Every step container has terminated
    pub containers_terminated: bool,
}

/// Derives one step per step container of `pod`
///
/// `previous` holds the steps recorded last time; matching steps keep their
/// timestamps so that repeated extraction is stable.
pub fn extract_steps(pod: &PodSnapshot, previous: &[CoreActivityStep]) -> ExtractedSteps {
    let containers = pod.step_containers();
    let mut steps: Vec<CoreActivityStep> = Vec::with_capacity(containers.len());
    let mut containers_terminated = !containers.is_empty();

    for container in containers {
        let title = step_title(&container.name);
        let mut step = previous
            .iter()
            .find(|step| step.name == title)
            .cloned()
            .unwrap_or_else(|| CoreActivityStep::named(&title));

        let predecessor = steps.last();
        let status = step_status(&container.state, predecessor);
        if !container.state.is_terminated() {
            containers_terminated = false;
        }

        if status != ActivityStatus::Pending && step.started_timestamp.is_none() {
            step.started_timestamp = start_time(predecessor, &container.state);
        }
        if let ContainerState::Terminated {
            finished_at: Some(finished),
            ..
        } = container.state
        {
            step.completed_timestamp.get_or_insert(finished);
        }
        if let Some(url) = container.arg_value("-url") {
            step.description = url.to_string();
        }
        step.status = status;
        steps.push(step);
    }

    ExtractedSteps {
        steps,
        containers_terminated,
    }
}

/// Status of a step given its container and the step before it
pub fn step_status(
    state: &ContainerState,
    predecessor: Option<&CoreActivityStep>,
) -> ActivityStatus {
    match state {
        ContainerState::Terminated { exit_code: 0, .. } if predecessor.is_some_and(did_fail) => {
            ActivityStatus::NotExecuted
        }
        ContainerState::Terminated { exit_code: 0, .. } => ActivityStatus::Succeeded,
        ContainerState::Terminated { .. } => ActivityStatus::Failed,
        ContainerState::Running { .. } if predecessor.is_none_or(is_complete) => {
            ActivityStatus::Running
        }
        _ => ActivityStatus::Pending,
    }
}

fn is_complete(step: &CoreActivityStep) -> bool {
    step.completed_timestamp.is_some() || step.status.is_finished()
}

fn did_fail(step: &CoreActivityStep) -> bool {
    is_complete(step) && step.status != ActivityStatus::Succeeded
}

/// The predecessor's completion, else the container's own start
fn start_time(
    predecessor: Option<&CoreActivityStep>,
    state: &ContainerState,
) -> Option<DateTime<Utc>> {
    predecessor
        .and_then(|step| step.completed_timestamp)
        .or_else(|| state.started_at())
}
