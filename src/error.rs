use thiserror::Error;

use crate::core::task::{TaskId, TaskState};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Dependency cycle detected involving tasks: {}", format_ids(tasks))]
    Cycle { tasks: Vec<TaskId> },

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Structural errors abort a run before any task starts.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::Cycle { .. } | Error::UnknownDependency { .. } | Error::DuplicateTask(_)
        )
    }
}

fn format_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;
