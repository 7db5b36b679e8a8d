//! Data Transfer Objects
//!
//! Values exchanged with external collaborators, independent of any one
//! provider's wire format.

pub mod git;
