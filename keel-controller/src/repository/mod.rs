//! Repository layer
//!
//! Access to the cluster resources the controllers read and write. The
//! services only see the traits below; [`KubeStore`] implements all of them
//! against the Kubernetes API.
//!
//! All repositories are trait-based to enable testing and mocking.

mod cluster;

use async_trait::async_trait;
use keel_core::domain::activity::PipelineActivity;
use keel_core::domain::environment::Environment;
use keel_core::domain::pod::PodSnapshot;
use keel_core::domain::run::PipelineRunInfo;
use keel_core::domain::workflow::Workflow;
use thiserror::Error;

pub use cluster::KubeStore;
pub(crate) use cluster::{CustomKind, decode, pod_snapshot};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' was modified concurrently")]
    Conflict { kind: &'static str, name: String },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid resource: {0}")]
    Invalid(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Custom resources and secrets of the controller namespace
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_activity(&self, name: &str) -> StoreResult<Option<PipelineActivity>>;

    async fn list_activities(&self) -> StoreResult<Vec<PipelineActivity>>;

    async fn create_activity(&self, activity: &PipelineActivity) -> StoreResult<PipelineActivity>;

    /// Replaces the activity, failing with [`StoreError::Conflict`] when the
    /// stored resource version moved on
    async fn update_activity(&self, activity: &PipelineActivity) -> StoreResult<PipelineActivity>;

    async fn list_workflows(&self) -> StoreResult<Vec<Workflow>>;

    async fn create_workflow(&self, workflow: &Workflow) -> StoreResult<Workflow>;

    async fn get_environment(&self, name: &str) -> StoreResult<Option<Environment>>;

    async fn list_environments(&self) -> StoreResult<Vec<Environment>>;

    /// Every secret value in the namespace, used to mask build logs
    async fn list_secret_values(&self) -> StoreResult<Vec<String>>;
}

/// Pipeline runs composed with their pods and structure
#[async_trait]
pub trait RunSource: Send + Sync {
    async fn pipeline_run(&self, name: &str) -> StoreResult<Option<PipelineRunInfo>>;
}

/// Container logs of build pods
#[async_trait]
pub trait BuildLogSource: Send + Sync {
    async fn container_logs(&self, pod: &PodSnapshot, container: &str) -> StoreResult<String>;
}

/// Reads the activity, applies `mutate` and writes it back if anything changed
///
/// Returns the stored activity, or `None` if it does not exist.
pub async fn patch_activity<F>(
    store: &dyn ResourceStore,
    name: &str,
    mutate: F,
) -> StoreResult<Option<PipelineActivity>>
where
    F: FnOnce(&mut PipelineActivity) + Send,
{
    let Some(mut activity) = store.get_activity(name).await? else {
        return Ok(None);
    };
    let before = activity.snapshot()?;
    mutate(&mut activity);
    if activity.snapshot()? == before {
        return Ok(Some(activity));
    }
    store.update_activity(&activity).await.map(Some)
}
