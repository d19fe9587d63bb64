//! Core domain models for epic execution.
//!
//! This module contains the task data model and the dependency graph that
//! tracks readiness while a run is in progress.

pub mod graph;
pub mod task;

pub use graph::DependencyGraph;
pub use task::{TaskId, TaskRecord, TaskState};
