//! Build status derivation
//!
//! - [`extract`]: container lifecycle state to leaf step status
//! - [`aggregate`]: bottom-up rollup of steps into stages and stages into the
//!   pipeline, including the terminal-status latch

pub mod aggregate;
pub mod extract;

pub use aggregate::{Rollup, apply_pod, apply_run, rollup_pipeline};
pub use extract::{ExtractedSteps, extract_steps};
