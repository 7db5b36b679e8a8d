//! Build keys
//!
//! Every build pod carries enough git metadata to identify the activity it
//! reports into: the source URL and revision given to its git-source step, and
//! the `REPO_OWNER`/`BRANCH_NAME`/`BUILD_NUMBER` style variables set on its
//! containers. [`ActivityKey`] collects that metadata and knows how to stamp it
//! onto a [`PipelineActivity`].

use crate::domain::activity::PipelineActivity;
use crate::domain::pod::{CONTEXT_LABEL, PodSnapshot};
use crate::domain::run::PipelineRunInfo;
use crate::git::GitRepository;
use crate::naming::{activity_name, digit_suffix};

pub const SOURCE_REPOSITORY_LABEL: &str = "sourcerepository";
pub const BRANCH_LABEL: &str = "branch";
pub const OWNER_LABEL: &str = "owner";
pub const REPOSITORY_LABEL: &str = "repository";
pub const BUILD_LABEL: &str = "build";

const DEFAULT_BUILD: &str = "1";
const DEFAULT_BRANCH: &str = "master";
const GIT_SOURCE_PREFIXES: [&str; 2] = ["build-step-git-source", "step-git-source"];

/// Identity of the activity a pod or run reports into
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityKey {
    pub name: String,
    pub pipeline: String,
    pub build: String,
    pub git_url: String,
    pub owner: String,
    pub repository: String,
    pub branch: String,
    pub last_commit_sha: String,
    pub context: String,
}

fn is_commit_sha(value: &str) -> bool {
    value.len() == 40 && value.chars().all(|c| c.is_ascii_hexdigit())
}

impl ActivityKey {
    /// Reads the key from a build pod, `None` if it has no usable git metadata
    pub fn from_pod(pod: &PodSnapshot) -> Option<Self> {
        let mut git_url = String::new();
        let mut branch = String::new();
        let mut sha = String::new();
        let mut owner = String::new();
        let mut repository = String::new();
        let mut build = String::new();
        let mut pull_sha = String::new();
        let mut base_sha = String::new();
        let mut source_url = String::new();

        for container in pod.step_containers() {
            if GIT_SOURCE_PREFIXES
                .iter()
                .any(|prefix| container.name.starts_with(prefix))
            {
                if let Some(url) = container.arg_value("-url") {
                    git_url = url.to_string();
                }
                if let Some(revision) = container.arg_value("-revision") {
                    if is_commit_sha(revision) {
                        sha = revision.to_string();
                    } else {
                        branch = revision.to_string();
                    }
                }
            }

            let assign = |name: &str, target: &mut String| {
                if let Some(value) = container.env_var(name) {
                    *target = value.to_string();
                }
            };
            assign("PULL_PULL_SHA", &mut pull_sha);
            assign("PULL_BASE_SHA", &mut base_sha);
            assign("BRANCH_NAME", &mut branch);
            assign("REPO_OWNER", &mut owner);
            assign("REPO_NAME", &mut repository);
            assign("JX_BUILD_NUMBER", &mut build);
            assign("SOURCE_URL", &mut source_url);
            if build.is_empty() {
                assign("BUILD_NUMBER", &mut build);
                assign("BUILD_ID", &mut build);
            }
        }

        if git_url.is_empty() {
            git_url = source_url;
        }
        if sha.is_empty() {
            sha = if pull_sha.is_empty() { base_sha } else { pull_sha };
        }
        if build.is_empty() {
            build = pod
                .label(BUILD_LABEL)
                .map(str::to_string)
                .or_else(|| {
                    pod.build_name()
                        .map(digit_suffix)
                        .filter(|digits| !digits.is_empty())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| DEFAULT_BUILD.to_string());
        }
        if branch.is_empty() {
            branch = DEFAULT_BRANCH.to_string();
        }

        Self::assemble(
            git_url,
            owner,
            repository,
            branch,
            build,
            sha,
            pod.label(CONTEXT_LABEL).unwrap_or_default().to_string(),
        )
    }

    /// Reads the key from the first pod of a run; run labels take precedence
    pub fn from_run(run: &PipelineRunInfo) -> Option<Self> {
        let mut key = run.pods().find_map(Self::from_pod)?;
        let label = |name: &str| {
            run.labels
                .get(name)
                .map(String::as_str)
                .filter(|value| !value.is_empty())
        };
        if let Some(build) = label(BUILD_LABEL) {
            key.build = build.to_string();
        }
        if let Some(context) = label(CONTEXT_LABEL) {
            key.context = context.to_string();
        }
        Self::assemble(
            key.git_url,
            key.owner,
            key.repository,
            key.branch,
            key.build,
            key.last_commit_sha,
            key.context,
        )
    }

    fn assemble(
        git_url: String,
        mut owner: String,
        mut repository: String,
        branch: String,
        build: String,
        last_commit_sha: String,
        context: String,
    ) -> Option<Self> {
        if !git_url.is_empty() {
            if let Ok(repo) = GitRepository::parse(&git_url) {
                if owner.is_empty() {
                    owner = repo.organisation;
                }
                if repository.is_empty() {
                    repository = repo.name;
                }
            }
        }
        if owner.is_empty() || repository.is_empty() {
            return None;
        }

        Some(Self {
            name: activity_name(&owner, &repository, &branch, &build),
            pipeline: format!("{owner}/{repository}/{branch}"),
            build,
            git_url,
            owner,
            repository,
            branch,
            last_commit_sha,
            context,
        })
    }

    pub fn new_activity(&self) -> PipelineActivity {
        let mut activity = PipelineActivity::new(&self.name);
        self.apply(&mut activity);
        activity
    }

    /// Fills empty identity fields and labels, returning true if anything changed
    pub fn apply(&self, activity: &mut PipelineActivity) -> bool {
        let mut changed = false;
        let spec = &mut activity.spec;
        for (field, value) in [
            (&mut spec.git_url, &self.git_url),
            (&mut spec.git_owner, &self.owner),
            (&mut spec.git_repository, &self.repository),
            (&mut spec.git_branch, &self.branch),
            (&mut spec.build, &self.build),
            (&mut spec.pipeline, &self.pipeline),
            (&mut spec.context, &self.context),
            (&mut spec.last_commit_sha, &self.last_commit_sha),
        ] {
            if field.is_empty() && !value.is_empty() {
                *field = value.clone();
                changed = true;
            }
        }

        let meta = &mut activity.metadata;
        changed |= meta.ensure_label(SOURCE_REPOSITORY_LABEL, &self.repository);
        changed |= meta.ensure_label(REPOSITORY_LABEL, &self.repository);
        changed |= meta.ensure_label(BRANCH_LABEL, &self.branch);
        changed |= meta.ensure_label(OWNER_LABEL, &self.owner);
        changed |= meta.ensure_label(BUILD_LABEL, &self.build);
        changed |= meta.ensure_label(CONTEXT_LABEL, &self.context);
        changed
    }
}
