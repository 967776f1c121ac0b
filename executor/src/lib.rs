//! Execution stage of the stint performance-measurement harness.
//!
//! Takes an already-built benchmark artifact, resolves the execution-target
//! variant into a launch plan, runs the artifact as a guarded child process
//! while synchronizing the engine's output protocol, enforces a hard
//! wall-clock ceiling, and folds everything into an
//! [`execute::ExecutionResult`] even when the child misbehaves.
//!
//! Building the artifact, generating target projects, and persisting or
//! analyzing the collected measurements live in other stages.

pub mod config;
pub mod diagnostics;
pub mod execute;
pub mod planner;
