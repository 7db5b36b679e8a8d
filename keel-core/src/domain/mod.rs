//! Core domain types
//!
//! The resources the controllers read and write, plus the snapshots of pods and
//! pipeline runs they derive status from. Resource types mirror the logical shape
//! of the stored objects so they can be converted to and from the cluster's JSON.

pub mod activity;
pub mod environment;
pub mod meta;
pub mod pod;
pub mod run;
pub mod status;
pub mod workflow;
