//! Orchestration layer for epic execution.
//!
//! This module provides the static level planner, the collaborator
//! contracts for implementing and verifying tasks, and the execution pool
//! that drives a dependency graph to completion under a concurrency bound.

mod collaborator;
mod planner;
mod pool;
mod status;

pub use collaborator::{
    Artifacts, CommandImplementer, CommandSpec, CommandVerifier, CriterionResult, Implementer,
    VerificationReport, Verifier, DEFAULT_COMMAND_TIMEOUT_SECS,
};
pub use planner::{compute_plan, ExecutionPlan, FileConflict};
pub use pool::{ExecutionPool, PoolConfig, PoolEvent, RetryMode, RetryPolicy, CANCELLED};
pub use status::{FailureReport, PoolStatus, StateCounts, TaskSummary};
