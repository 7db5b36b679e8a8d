//! Scheduler layer for the workflow controller
//!
//! Watch events and poll ticks are funnelled through one channel into a
//! single worker that owns the workflow engine, so event handling and
//! promotion polling never interleave.

pub mod poller;
pub mod worker;

pub use poller::PollTimer;
pub use worker::{ChannelHandler, WorkflowWorker};
