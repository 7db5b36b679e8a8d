//! Keel Core
//!
//! Core types and pure logic for the Keel continuous-delivery controllers.
//!
//! This crate contains:
//! - Domain types: the persisted resources (PipelineActivity, Workflow, Environment)
//!   and the pod / pipeline-run snapshots the controllers observe
//! - DTOs: values exchanged with git providers
//! - Status: step extraction from container state and the stage rollup fold
//! - Helpers for naming, git URLs and build keys

pub mod domain;
pub mod dto;
pub mod git;
pub mod key;
pub mod naming;
pub mod status;
