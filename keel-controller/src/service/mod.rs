//! Service Module
//!
//! Controller logic. The build side turns pod and pipeline run changes
//! into activity status; the workflow side promotes released activities
//! through their environments.

pub mod completion;
pub mod dedup;
pub mod git_status;
pub mod masker;
pub mod promotion;
pub mod promotion_poller;
pub mod reconciler;
pub mod workflow;

pub use completion::CompletionEffects;
pub use git_status::GitStatusReporter;
pub use promotion::PullRequestPromoter;
pub use promotion_poller::PromotionPoller;
pub use reconciler::{BuildEventHandler, BuildStatusReconciler};
pub use workflow::WorkflowEngine;
