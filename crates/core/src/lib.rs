//! Shared types for the comfyrun workspace.
//!
//! Holds the job description model and the mutations applied to it
//! before submission, plus the identifier aliases used across crates.

pub mod error;
pub mod types;
pub mod workflow;
