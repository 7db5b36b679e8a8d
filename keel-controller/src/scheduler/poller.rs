//! Promotion poll timer

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::worker::WorkflowCommand;

/// Asks the workflow worker for a poll cycle on every tick.
///
/// The next tick is only taken once the previous cycle has been
/// acknowledged, so cycles never overlap.
pub struct PollTimer {
    interval: Duration,
    sender: mpsc::Sender<WorkflowCommand>,
    cancel: CancellationToken,
}

impl PollTimer {
    pub fn new(
        interval: Duration,
        sender: mpsc::Sender<WorkflowCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            interval,
            sender,
            cancel,
        }
    }

    pub async fn run(self) {
        info!("Starting promotion poller (interval: {:?})", self.interval);
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let (done, wait) = oneshot::channel();
            if self.sender.send(WorkflowCommand::Poll(done)).await.is_err() {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = wait => debug!("Promotion poll acknowledged"),
            }
        }
        info!("Promotion poller stopped");
    }
}
