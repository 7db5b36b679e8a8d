//! Resource watching
//!
//! Watch streams are normalized into [`ResourceEvent`]s and handed to an
//! [`EventHandler`]. Each watched kind runs its own loop; there is no
//! ordering between kinds.

mod stream;

use async_trait::async_trait;
use keel_core::domain::activity::PipelineActivity;
use keel_core::domain::pod::PodSnapshot;
use keel_core::domain::workflow::Workflow;

pub use stream::{ResourceWatcher, WatchedKind};

/// A change to a watched resource
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    PodChanged(PodSnapshot),
    /// Only the name is carried; the run is recomposed from its pods
    PipelineRunChanged(String),
    ActivityChanged(PipelineActivity),
    ActivityDeleted(String),
    WorkflowChanged(Workflow),
    WorkflowDeleted(String),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: ResourceEvent);
}
