//! Workflow worker
//!
//! Serializes every mutation of the workflow engine onto one task.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::service::WorkflowEngine;
use crate::watch::{EventHandler, ResourceEvent};

const QUEUE_DEPTH: usize = 256;

#[derive(Debug)]
pub enum WorkflowCommand {
    Event(ResourceEvent),
    /// Run one promotion poll cycle and signal when it is done
    Poll(oneshot::Sender<()>),
}

pub struct WorkflowWorker {
    engine: WorkflowEngine,
    receiver: mpsc::Receiver<WorkflowCommand>,
}

impl WorkflowWorker {
    pub fn new(engine: WorkflowEngine) -> (Self, mpsc::Sender<WorkflowCommand>) {
        let (sender, receiver) = mpsc::channel(QUEUE_DEPTH);
        (Self { engine, receiver }, sender)
    }

    /// Processes commands until every sender has been dropped
    pub async fn run(mut self) -> WorkflowEngine {
        info!("Starting workflow worker");
        while let Some(command) = self.receiver.recv().await {
            match command {
                WorkflowCommand::Event(event) => self.engine.handle(event).await,
                WorkflowCommand::Poll(done) => {
                    self.engine.poll_promotions().await;
                    debug!(cached = self.engine.cached_activities(), "Poll cycle finished");
                    let _ = done.send(());
                }
            }
        }
        info!("Workflow worker stopped");
        self.engine
    }
}

/// Forwards watch events to the workflow worker
#[derive(Clone)]
pub struct ChannelHandler {
    sender: mpsc::Sender<WorkflowCommand>,
}

impl ChannelHandler {
    pub fn new(sender: mpsc::Sender<WorkflowCommand>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl EventHandler for ChannelHandler {
    async fn handle(&self, event: ResourceEvent) {
        if self.sender.send(WorkflowCommand::Event(event)).await.is_err() {
            warn!("Workflow worker is gone, dropping event");
        }
    }
}
