//! In-memory fakes shared by the controller tests

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use keel_client::{ClientError, GitProvider};
use keel_core::domain::activity::PipelineActivity;
use keel_core::domain::environment::Environment;
use keel_core::domain::pod::PodSnapshot;
use keel_core::domain::run::PipelineRunInfo;
use keel_core::domain::workflow::Workflow;
use keel_core::dto::git::{CommitInfo, CommitStatusInfo, CreatePullRequest, PullRequestInfo};

use crate::repository::{
    BuildLogSource, ResourceStore, RunSource, StoreError, StoreResult,
};
use crate::service::promotion::{PromotionOutcome, PromotionRequest, Promoter};

/// Store with optimistic concurrency on activities
#[derive(Default)]
pub struct InMemoryStore {
    activities: Mutex<BTreeMap<String, PipelineActivity>>,
    workflows: Mutex<Vec<Workflow>>,
    environments: Mutex<Vec<Environment>>,
    secrets: Mutex<Vec<String>>,
    runs: Mutex<BTreeMap<String, PipelineRunInfo>>,
    writes: AtomicUsize,
    failing_reads: AtomicUsize,
    version: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> Option<String> {
        Some((self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string())
    }

    pub fn insert_activity(&self, mut activity: PipelineActivity) {
        activity.metadata.resource_version = self.next_version();
        self.activities
            .lock()
            .unwrap()
            .insert(activity.name().to_string(), activity);
    }

    pub fn activity(&self, name: &str) -> Option<PipelineActivity> {
        self.activities.lock().unwrap().get(name).cloned()
    }

    pub fn insert_workflow(&self, workflow: Workflow) {
        self.workflows.lock().unwrap().push(workflow);
    }

    pub fn workflows(&self) -> Vec<Workflow> {
        self.workflows.lock().unwrap().clone()
    }

    pub fn insert_environment(&self, environment: Environment) {
        self.environments.lock().unwrap().push(environment);
    }

    pub fn insert_secret(&self, value: &str) {
        self.secrets.lock().unwrap().push(value.to_string());
    }

    pub fn insert_run(&self, run: PipelineRunInfo) {
        self.runs.lock().unwrap().insert(run.name.clone(), run);
    }

    /// Number of successful activity creates and updates
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes the next `count` activity reads fail
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get_activity(&self, name: &str) -> StoreResult<Option<PipelineActivity>> {
        let failing = self.failing_reads.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_reads.store(failing - 1, Ordering::SeqCst);
            return Err(StoreError::Invalid("injected read failure".to_string()));
        }
        Ok(self.activity(name))
    }

    async fn list_activities(&self) -> StoreResult<Vec<PipelineActivity>> {
        Ok(self.activities.lock().unwrap().values().cloned().collect())
    }

    async fn create_activity(&self, activity: &PipelineActivity) -> StoreResult<PipelineActivity> {
        let mut activities = self.activities.lock().unwrap();
        if activities.contains_key(activity.name()) {
            return Err(StoreError::Conflict {
                kind: "PipelineActivity",
                name: activity.name().to_string(),
            });
        }
        let mut created = activity.clone();
        created.metadata.resource_version = self.next_version();
        activities.insert(created.name().to_string(), created.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn update_activity(&self, activity: &PipelineActivity) -> StoreResult<PipelineActivity> {
        let mut activities = self.activities.lock().unwrap();
        let Some(stored) = activities.get(activity.name()) else {
            return Err(StoreError::NotFound {
                kind: "PipelineActivity",
                name: activity.name().to_string(),
            });
        };
        if stored.metadata.resource_version != activity.metadata.resource_version {
            return Err(StoreError::Conflict {
                kind: "PipelineActivity",
                name: activity.name().to_string(),
            });
        }
        let mut updated = activity.clone();
        updated.metadata.resource_version = self.next_version();
        activities.insert(updated.name().to_string(), updated.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn list_workflows(&self) -> StoreResult<Vec<Workflow>> {
        Ok(self.workflows())
    }

    async fn create_workflow(&self, workflow: &Workflow) -> StoreResult<Workflow> {
        self.insert_workflow(workflow.clone());
        Ok(workflow.clone())
    }

    async fn get_environment(&self, name: &str) -> StoreResult<Option<Environment>> {
        Ok(self
            .environments
            .lock()
            .unwrap()
            .iter()
            .find(|env| env.name() == name)
            .cloned())
    }

    async fn list_environments(&self) -> StoreResult<Vec<Environment>> {
        Ok(self.environments.lock().unwrap().clone())
    }

    async fn list_secret_values(&self) -> StoreResult<Vec<String>> {
        Ok(self.secrets.lock().unwrap().clone())
    }
}

#[async_trait]
impl RunSource for InMemoryStore {
    async fn pipeline_run(&self, name: &str) -> StoreResult<Option<PipelineRunInfo>> {
        Ok(self.runs.lock().unwrap().get(name).cloned())
    }
}

#[async_trait]
impl BuildLogSource for InMemoryStore {
    async fn container_logs(&self, _pod: &PodSnapshot, container: &str) -> StoreResult<String> {
        Ok(format!("{container} started\nusing token s3cr3t-token\n"))
    }
}

/// Git provider that records every write
#[derive(Default)]
pub struct FakeGitProvider {
    pub pull_requests: Mutex<BTreeMap<u64, PullRequestInfo>>,
    pub last_commit_status: Mutex<String>,
    pub commit_statuses: Mutex<Vec<CommitStatusInfo>>,
    pub commits: Mutex<Vec<CommitInfo>>,
    pub reported: Mutex<Vec<CommitStatusInfo>>,
    pub comments: Mutex<Vec<(String, u64, String)>>,
    pub merged: Mutex<Vec<u64>>,
    pub created: Mutex<Vec<CreatePullRequest>>,
    pub branches: Mutex<Vec<String>>,
    pub files: Mutex<Vec<(String, String, String)>>,
}

impl FakeGitProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pull_request(self, pr: PullRequestInfo) -> Self {
        self.pull_requests.lock().unwrap().insert(pr.number, pr);
        self
    }

    pub fn set_last_commit_status(&self, status: &str) {
        *self.last_commit_status.lock().unwrap() = status.to_string();
    }

    pub fn set_commit_statuses(&self, statuses: Vec<CommitStatusInfo>) {
        *self.commit_statuses.lock().unwrap() = statuses;
    }

    pub fn set_commits(&self, commits: Vec<CommitInfo>) {
        *self.commits.lock().unwrap() = commits;
    }

    pub fn reported(&self) -> Vec<CommitStatusInfo> {
        self.reported.lock().unwrap().clone()
    }

    pub fn comments(&self) -> Vec<(String, u64, String)> {
        self.comments.lock().unwrap().clone()
    }

    pub fn merged(&self) -> Vec<u64> {
        self.merged.lock().unwrap().clone()
    }

    pub fn created(&self) -> Vec<CreatePullRequest> {
        self.created.lock().unwrap().clone()
    }

    pub fn files(&self) -> Vec<(String, String, String)> {
        self.files.lock().unwrap().clone()
    }
}

#[async_trait]
impl GitProvider for FakeGitProvider {
    async fn get_pull_request(
        &self,
        _owner: &str,
        _repo: &str,
        number: u64,
    ) -> keel_client::Result<PullRequestInfo> {
        self.pull_requests
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("pull request {number}")))
    }

    async fn pull_request_last_commit_status(
        &self,
        _pr: &PullRequestInfo,
    ) -> keel_client::Result<String> {
        Ok(self.last_commit_status.lock().unwrap().clone())
    }

    async fn merge_pull_request(
        &self,
        pr: &PullRequestInfo,
        _message: &str,
    ) -> keel_client::Result<()> {
        self.merged.lock().unwrap().push(pr.number);
        Ok(())
    }

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        req: &CreatePullRequest,
    ) -> keel_client::Result<PullRequestInfo> {
        let mut created = self.created.lock().unwrap();
        created.push(req.clone());
        let number = 100 + created.len() as u64;
        Ok(PullRequestInfo {
            owner: owner.to_string(),
            repository: repo.to_string(),
            number,
            url: format!("https://github.com/{owner}/{repo}/pull/{number}"),
            title: req.title.clone(),
            state: "open".to_string(),
            ..Default::default()
        })
    }

    async fn list_commits(
        &self,
        _owner: &str,
        _repo: &str,
        _sha: &str,
        _page: u32,
        per_page: u32,
    ) -> keel_client::Result<Vec<CommitInfo>> {
        let commits = self.commits.lock().unwrap();
        Ok(commits.iter().take(per_page as usize).cloned().collect())
    }

    async fn list_commit_statuses(
        &self,
        _owner: &str,
        _repo: &str,
        _sha: &str,
    ) -> keel_client::Result<Vec<CommitStatusInfo>> {
        Ok(self.commit_statuses.lock().unwrap().clone())
    }

    async fn update_commit_status(
        &self,
        _owner: &str,
        _repo: &str,
        _sha: &str,
        status: &CommitStatusInfo,
    ) -> keel_client::Result<()> {
        self.reported.lock().unwrap().push(status.clone());
        Ok(())
    }

    async fn create_issue_comment(
        &self,
        _owner: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> keel_client::Result<()> {
        self.comments
            .lock()
            .unwrap()
            .push((repo.to_string(), number, body.to_string()));
        Ok(())
    }

    async fn create_branch(
        &self,
        _owner: &str,
        _repo: &str,
        _from: &str,
        branch: &str,
    ) -> keel_client::Result<()> {
        self.branches.lock().unwrap().push(branch.to_string());
        Ok(())
    }

    async fn put_file(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
        data: &[u8],
        _message: &str,
    ) -> keel_client::Result<String> {
        self.files.lock().unwrap().push((
            branch.to_string(),
            path.to_string(),
            String::from_utf8_lossy(data).into_owned(),
        ));
        Ok(format!(
            "https://{owner}.github.io/{repo}/{}",
            path.trim_start_matches('/')
        ))
    }
}

/// Promoter that records requests and opens numbered pull requests
#[derive(Default)]
pub struct RecordingPromoter {
    pub requests: Mutex<Vec<PromotionRequest>>,
}

impl RecordingPromoter {
    pub fn requests(&self) -> Vec<PromotionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Promoter for RecordingPromoter {
    async fn promote(&self, request: &PromotionRequest) -> anyhow::Result<PromotionOutcome> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request.clone());
        let number = requests.len() as u64;
        Ok(PromotionOutcome {
            pull_request_url: format!(
                "https://github.com/org/environment-{}/pull/{number}",
                request.environment
            ),
            number,
        })
    }
}
