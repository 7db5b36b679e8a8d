//! Stage aggregation
//!
//! Status flows bottom-up: containers to steps, steps to their stage, child
//! stages to their parent, and top-level stages to the pipeline. Every level
//! uses the same [`Rollup`] rule:
//!
//! - complete when every child has finished
//! - failed when any finished child failed
//! - running when any child is running
//!
//! A pod whose containers have all terminated completes its stage even if the
//! derived steps disagree, so that a missed event cannot leave it running.

use chrono::{DateTime, Utc};

use crate::domain::activity::{CoreActivityStep, PipelineActivity, StageActivityStep};
use crate::domain::pod::PodSnapshot;
use crate::domain::run::{META_PIPELINE_STAGE, PipelineRunInfo};
use crate::domain::status::ActivityStatus;
use crate::status::extract::extract_steps;

/// Combined state of a set of sibling steps or stages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rollup {
    pub all_completed: bool,
    pub failed: bool,
    pub running: bool,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
}

impl Rollup {
    pub fn of<'a>(children: impl IntoIterator<Item = &'a CoreActivityStep>) -> Self {
        let mut rollup = Rollup::default();
        let mut any = false;
        let mut all_completed = true;

        for child in children {
            any = true;
            let finished = child.status.is_finished() || child.completed_timestamp.is_some();
            if !finished {
                all_completed = false;
            }
            if finished && child.status.is_failure() {
                rollup.failed = true;
            }
            if child.status == ActivityStatus::Running {
                rollup.running = true;
            }
            rollup.started = earliest(rollup.started, child.started_timestamp);
            rollup.completed = latest(rollup.completed, child.completed_timestamp);
        }

        rollup.all_completed = any && all_completed;
        rollup
    }

    /// Status this rollup gives its parent
    pub fn status(&self, force_complete: bool, active: bool) -> ActivityStatus {
        if self.all_completed || force_complete {
            if self.failed {
                ActivityStatus::Failed
            } else {
                ActivityStatus::Succeeded
            }
        } else if self.running || active {
            ActivityStatus::Running
        } else {
            ActivityStatus::Pending
        }
    }
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Writes a rollup into a stage; timestamps are only ever filled, never moved
fn apply_rollup(core: &mut CoreActivityStep, rollup: &Rollup, force_complete: bool, active: bool) {
    core.status = rollup.status(force_complete, active);
    if core.started_timestamp.is_none() {
        core.started_timestamp = rollup.started;
    }
    if core.status.is_terminated() && core.completed_timestamp.is_none() {
        core.completed_timestamp = rollup.completed;
    }
}

/// Refreshes a leaf stage from the pod that executes it
pub fn aggregate_pod_stage(stage: &mut StageActivityStep, pod: &PodSnapshot) {
    let extracted = extract_steps(pod, &stage.steps);
    stage.steps = extracted.steps;

    let rollup = Rollup::of(&stage.steps);
    apply_rollup(&mut stage.core, &rollup, extracted.containers_terminated, true);

    if stage.core.status == ActivityStatus::Failed {
        for step in stage.steps.iter_mut() {
            if matches!(step.status, ActivityStatus::Pending | ActivityStatus::None) {
                step.status = ActivityStatus::NotExecuted;
            }
        }
    }
}

/// Refreshes every stage of `activity` from a pipeline run
///
/// Stages are visited children first, so a parent always aggregates the
/// freshly computed state of its children.
pub fn apply_run(activity: &mut PipelineActivity, run: &PipelineRunInfo) {
    for index in run.post_order() {
        let node = &run.stages[index];
        let name = run.full_name(index);

        if let Some(pod) = &node.pod {
            aggregate_pod_stage(activity.get_or_create_stage(&name), pod);
        } else if !node.children.is_empty() {
            let children: Vec<CoreActivityStep> = node
                .children
                .iter()
                .map(|&child| {
                    activity
                        .stage(&run.full_name(child))
                        .map(|stage| stage.core.clone())
                        .unwrap_or_default()
                })
                .collect();
            let rollup = Rollup::of(&children);
            apply_rollup(&mut activity.get_or_create_stage(&name).core, &rollup, false, false);
        } else {
            let stage = activity.get_or_create_stage(&name);
            if stage.core.status == ActivityStatus::None {
                stage.core.status = ActivityStatus::Pending;
            }
        }
    }
}

/// Refreshes a standalone build pod, one stage per container
///
/// Returns true when every container has terminated.
pub fn apply_pod(activity: &mut PipelineActivity, pod: &PodSnapshot) -> bool {
    let previous: Vec<CoreActivityStep> = activity.stages().map(|s| s.core.clone()).collect();
    let extracted = extract_steps(pod, &previous);
    for step in extracted.steps {
        let name = step.name.clone();
        activity.get_or_create_stage(&name).core = step;
    }
    extracted.containers_terminated
}

/// Rolls the pipeline status up from the top-level stages
///
/// Once the pipeline status is terminal it is latched: stages may still be
/// refreshed but the pipeline status and completion time never change again.
/// Returns true only on the call that first moves the pipeline to a terminal
/// status.
pub fn rollup_pipeline(
    activity: &mut PipelineActivity,
    force_complete: bool,
    now: DateTime<Utc>,
) -> bool {
    let rollup = Rollup::of(activity.stages().map(|stage| &stage.core));
    if activity.spec.started_timestamp.is_none() {
        activity.spec.started_timestamp = rollup.started;
    }
    if activity.spec.status.is_terminated() {
        return false;
    }

    let all_completed = rollup.all_completed || force_complete;
    if !(all_completed || (!rollup.running && rollup.failed)) {
        activity.spec.status = if rollup.running {
            ActivityStatus::Running
        } else {
            ActivityStatus::Pending
        };
        return false;
    }

    if rollup.failed {
        activity.spec.status = ActivityStatus::Failed;
        for stage in activity.stages_mut() {
            if matches!(stage.core.status, ActivityStatus::Pending | ActivityStatus::None) {
                stage.core.status = ActivityStatus::NotExecuted;
            }
        }
    } else if is_meta_pipeline(activity) {
        // the real pipeline reports into its own activity
        activity.spec.status = ActivityStatus::Running;
        return false;
    } else {
        activity.spec.status = ActivityStatus::Succeeded;
    }

    activity
        .spec
        .completed_timestamp
        .get_or_insert(rollup.completed.unwrap_or(now));
    true
}

fn is_meta_pipeline(activity: &PipelineActivity) -> bool {
    let mut stages = activity.stages();
    matches!(
        (stages.next(), stages.next()),
        (Some(stage), None) if stage.core.name == META_PIPELINE_STAGE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pod::{ContainerSnapshot, ContainerState, STAGE_NAME_LABEL};
    use crate::domain::run::{PipelineStructure, PipelineStructureStage};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn step(status: ActivityStatus, completed: Option<i64>) -> CoreActivityStep {
        CoreActivityStep {
            name: "s".to_string(),
            status,
            started_timestamp: Some(ts(1)),
            completed_timestamp: completed.map(ts),
            ..Default::default()
        }
    }

    fn terminated(exit_code: i32, finished: i64) -> ContainerState {
        ContainerState::Terminated {
            exit_code,
            started_at: Some(ts(100)),
            finished_at: Some(ts(finished)),
        }
    }

    fn stage_pod(stage: &str, containers: Vec<(&str, ContainerState)>) -> PodSnapshot {
        let mut pod = PodSnapshot {
            name: format!("pod-{stage}"),
            containers: containers
                .into_iter()
                .map(|(name, state)| ContainerSnapshot::named(name, state))
                .collect(),
            ..Default::default()
        };
        pod.labels
            .insert(STAGE_NAME_LABEL.to_string(), stage.to_string());
        pod
    }

    #[test]
    fn test_failed_step_fails_stage_with_latest_completion() {
        let steps = vec![
            step(ActivityStatus::Succeeded, Some(10)),
            step(ActivityStatus::Succeeded, Some(30)),
            step(ActivityStatus::Failed, Some(20)),
        ];
        let rollup = Rollup::of(&steps);
        assert!(rollup.all_completed);
        assert_eq!(rollup.status(false, true), ActivityStatus::Failed);

        let mut stage = CoreActivityStep::named("build");
        apply_rollup(&mut stage, &rollup, false, true);
        assert_eq!(stage.status, ActivityStatus::Failed);
        assert_eq!(stage.completed_timestamp, Some(ts(30)));
    }

    #[test]
    fn test_rollup_running_and_pending() {
        let steps = vec![
            step(ActivityStatus::Succeeded, Some(10)),
            step(ActivityStatus::Running, None),
            step(ActivityStatus::Pending, None),
        ];
        let rollup = Rollup::of(&steps);
        assert!(!rollup.all_completed);
        assert_eq!(rollup.status(false, false), ActivityStatus::Running);

        let pending = Rollup::of(&[step(ActivityStatus::Pending, None)]);
        assert_eq!(pending.status(false, false), ActivityStatus::Pending);
        let empty: Vec<CoreActivityStep> = Vec::new();
        assert_eq!(Rollup::of(&empty).status(false, false), ActivityStatus::Pending);
    }

    #[test]
    fn test_terminated_containers_force_completion() {
        let steps = vec![
            step(ActivityStatus::Succeeded, Some(10)),
            step(ActivityStatus::Running, None),
        ];
        let rollup = Rollup::of(&steps);
        assert!(!rollup.all_completed);

        let mut stage = CoreActivityStep::named("build");
        apply_rollup(&mut stage, &rollup, true, true);
        assert_eq!(stage.status, ActivityStatus::Succeeded);
        assert_eq!(stage.completed_timestamp, Some(ts(10)));
    }

    #[test]
    fn test_pending_steps_become_not_executed_when_stage_fails() {
        let mut stage = StageActivityStep::named("build");
        stage.steps = vec![
            CoreActivityStep {
                name: "Install".to_string(),
                status: ActivityStatus::Failed,
                ..Default::default()
            },
            CoreActivityStep {
                name: "Test".to_string(),
                status: ActivityStatus::Pending,
                ..Default::default()
            },
        ];
        let pod = stage_pod(
            "build",
            vec![
                ("build-step-install", terminated(1, 10)),
                ("build-step-test", ContainerState::Terminated { exit_code: 2, started_at: None, finished_at: None }),
                ("build-step-deploy", ContainerState::Waiting),
            ],
        );
        // the deploy container never ran; termination of the others is not enough
        aggregate_pod_stage(&mut stage, &pod);
        assert_eq!(stage.core.status, ActivityStatus::Running);

        let pod = stage_pod(
            "build",
            vec![
                ("build-step-install", terminated(1, 10)),
                ("build-step-test", terminated(0, 11)),
                ("build-step-deploy", terminated(0, 12)),
            ],
        );
        aggregate_pod_stage(&mut stage, &pod);
        let statuses: Vec<ActivityStatus> = stage.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                ActivityStatus::Failed,
                ActivityStatus::NotExecuted,
                ActivityStatus::NotExecuted
            ]
        );
        assert_eq!(stage.core.status, ActivityStatus::Failed);
    }

    #[test]
    fn test_standalone_pod_failure_completes_pipeline() {
        let pod = PodSnapshot {
            name: "build-pod".to_string(),
            containers: vec![
                ContainerSnapshot::named("build-step-install", terminated(0, 120)),
                ContainerSnapshot::named("build-step-test", terminated(1, 140)),
            ],
            ..Default::default()
        };
        let mut activity = PipelineActivity::new("a");
        let terminated = apply_pod(&mut activity, &pod);
        assert!(terminated);

        assert!(rollup_pipeline(&mut activity, terminated, ts(999)));
        assert_eq!(activity.spec.status, ActivityStatus::Failed);
        assert_eq!(activity.spec.completed_timestamp, Some(ts(140)));
        assert_eq!(activity.spec.started_timestamp, Some(ts(100)));
        assert_eq!(
            activity.stage("Test").unwrap().core.started_timestamp,
            Some(ts(120))
        );

        // latched: a second pass reports no new completion
        assert!(!rollup_pipeline(&mut activity, terminated, ts(999)));
    }

    #[test]
    fn test_apply_pod_refreshes_stages_in_place() {
        let mut pod = PodSnapshot {
            name: "build-pod".to_string(),
            containers: vec![
                ContainerSnapshot::named("build-step-install", terminated(0, 120)),
                ContainerSnapshot::named("build-step-test", ContainerState::Waiting),
            ],
            ..Default::default()
        };
        let mut activity = PipelineActivity::new("a");
        assert!(!apply_pod(&mut activity, &pod));

        pod.containers[1] = ContainerSnapshot::named("build-step-test", terminated(0, 150));
        assert!(apply_pod(&mut activity, &pod));

        let names: Vec<&str> = activity.stages().map(|s| s.core.name.as_str()).collect();
        assert_eq!(names, vec!["Install", "Test"]);
        assert_eq!(activity.stage("Test").unwrap().core.status, ActivityStatus::Succeeded);
    }

    #[test]
    fn test_terminal_status_never_regresses() {
        let mut activity = PipelineActivity::new("a");
        activity.spec.status = ActivityStatus::Succeeded;
        activity.get_or_create_stage("build").core.status = ActivityStatus::Running;

        assert!(!rollup_pipeline(&mut activity, false, ts(1)));
        assert_eq!(activity.spec.status, ActivityStatus::Succeeded);
    }

    #[test]
    fn test_failure_marks_pending_stages_not_executed() {
        let mut activity = PipelineActivity::new("a");
        let build = activity.get_or_create_stage("build");
        build.core.status = ActivityStatus::Failed;
        build.core.completed_timestamp = Some(ts(10));
        activity.get_or_create_stage("deploy").core.status = ActivityStatus::Pending;

        assert!(rollup_pipeline(&mut activity, false, ts(50)));
        assert_eq!(activity.spec.status, ActivityStatus::Failed);
        assert_eq!(
            activity.stage("deploy").unwrap().core.status,
            ActivityStatus::NotExecuted
        );
        assert_eq!(activity.spec.completed_timestamp, Some(ts(10)));
    }

    #[test]
    fn test_meta_pipeline_stays_running() {
        let mut activity = PipelineActivity::new("a");
        let stage = activity.get_or_create_stage(META_PIPELINE_STAGE);
        stage.core.status = ActivityStatus::Succeeded;
        stage.core.completed_timestamp = Some(ts(10));

        assert!(!rollup_pipeline(&mut activity, false, ts(50)));
        assert_eq!(activity.spec.status, ActivityStatus::Running);
        assert_eq!(activity.spec.completed_timestamp, None);
    }

    #[test]
    fn test_run_aggregates_parallel_children_into_parent() {
        let structure = PipelineStructure {
            stages: vec![
                PipelineStructureStage {
                    name: "Checks".to_string(),
                    parallel: vec!["Lint".to_string(), "Unit".to_string()],
                    ..Default::default()
                },
                PipelineStructureStage {
                    name: "Lint".to_string(),
                    depth: 1,
                    parent: Some("Checks".to_string()),
                    ..Default::default()
                },
                PipelineStructureStage {
                    name: "Unit".to_string(),
                    depth: 1,
                    parent: Some("Checks".to_string()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let pods = vec![
            stage_pod("Lint", vec![("step-lint", terminated(0, 30))]),
            stage_pod(
                "Unit",
                vec![("step-test", ContainerState::Running { started_at: Some(ts(100)) })],
            ),
        ];
        let run = PipelineRunInfo::compose("run", BTreeMap::new(), Some(&structure), pods);
        let mut activity = PipelineActivity::new("a");

        apply_run(&mut activity, &run);
        assert_eq!(
            activity.stage("Checks / Lint").unwrap().core.status,
            ActivityStatus::Succeeded
        );
        assert_eq!(
            activity.stage("Checks").unwrap().core.status,
            ActivityStatus::Running
        );
        assert!(!rollup_pipeline(&mut activity, false, ts(200)));
        assert_eq!(activity.spec.status, ActivityStatus::Running);

        let pods = vec![
            stage_pod("Lint", vec![("step-lint", terminated(0, 30))]),
            stage_pod("Unit", vec![("step-test", terminated(0, 90))]),
        ];
        let run = PipelineRunInfo::compose("run", BTreeMap::new(), Some(&structure), pods);
        apply_run(&mut activity, &run);

        let checks = activity.stage("Checks").unwrap();
        assert_eq!(checks.core.status, ActivityStatus::Succeeded);
        assert_eq!(checks.core.completed_timestamp, Some(ts(90)));
        assert!(rollup_pipeline(&mut activity, false, ts(200)));
        assert_eq!(activity.spec.status, ActivityStatus::Succeeded);
        assert_eq!(activity.spec.completed_timestamp, Some(ts(90)));
    }
}
