//! Task data model for the dependency graph.
//!
//! Tasks are the atomic units of work handed to the implementation and
//! verification collaborators. Each task tracks its lifecycle state, the
//! workspace it ran in, and the outcome of its last attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Identifier of a task, unique within an epic.
///
/// Epics number their tasks, so ids are small integers displayed
/// zero-padded (`007`). Ordering is numeric and is used as the
/// deterministic tie-breaker everywhere a set of ids is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u32);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

impl From<u32> for TaskId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Task state in its lifecycle.
///
/// `Completed`, `Failed` and `Skipped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Not yet evaluated.
    #[default]
    Pending,
    /// All dependencies completed, waiting for a pool slot.
    Ready,
    /// Bound to a workspace, implementation collaborator invoked.
    Running,
    /// Implementation returned, verification collaborator invoked.
    Verifying,
    /// Verification succeeded.
    Completed,
    /// Implementation, verification or workspace handling failed.
    Failed,
    /// A transitive dependency failed, or the run was cancelled.
    Skipped,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Skipped
        )
    }

    /// Running or Verifying: the task holds a pool slot and a workspace.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Running | TaskState::Verifying)
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Ready, Running)
                | (Ready, Failed)
                | (Ready, Skipped)
                | (Running, Verifying)
                | (Running, Failed)
                | (Verifying, Running)
                | (Verifying, Completed)
                | (Verifying, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Verifying => "verifying",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single task in the dependency graph.
///
/// The descriptive fields (`deliverables`, `acceptance_criteria`, `files`)
/// are opaque to scheduling and are only forwarded to collaborators and
/// the planner's conflict report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub deliverables: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default, alias = "dependencies")]
    pub depends_on: Vec<TaskId>,
    /// Files the task expects to create or modify.
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub state: TaskState,
    /// Number of implementation/verification attempts started.
    #[serde(default)]
    pub attempts: u32,
    /// Failure detail, or the reason a task was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Create a pending task with no dependencies.
    pub fn new(id: impl Into<TaskId>, name: &str) -> Self {
        Self {
            id: id.into(),
            name: name.to_string(),
            deliverables: String::new(),
            acceptance_criteria: Vec::new(),
            depends_on: Vec::new(),
            files: Vec::new(),
            state: TaskState::Pending,
            attempts: 0,
            error: None,
            workspace: None,
            branch: None,
            commit: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn depends_on(mut self, deps: &[u32]) -> Self {
        self.depends_on = deps.iter().map(|d| TaskId(*d)).collect();
        self
    }

    pub fn with_deliverables(mut self, deliverables: &str) -> Self {
        self.deliverables = deliverables.to_string();
        self
    }

    pub fn with_criteria(mut self, criteria: &[&str]) -> Self {
        self.acceptance_criteria = criteria.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_files(mut self, files: &[&str]) -> Self {
        self.files = files.iter().map(PathBuf::from).collect();
        self
    }

    /// Mark a record as completed by an earlier run.
    pub fn completed(mut self) -> Self {
        self.state = TaskState::Completed;
        self
    }

    /// Move to `next`, recording timestamps.
    ///
    /// # Errors
    /// Returns `InvalidTransition` if the lifecycle does not allow the move.
    pub fn transition(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                task: self.id,
                from: self.state,
                to: next,
            });
        }
        if next == TaskState::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.state = next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Render the instructions handed to a command-line collaborator.
    pub fn prompt(&self) -> String {
        let mut out = format!("# Task {}: {}\n", self.id, self.name);
        if !self.deliverables.trim().is_empty() {
            out.push_str("\n## Deliverables\n\n");
            out.push_str(self.deliverables.trim());
            out.push('\n');
        }
        if !self.acceptance_criteria.is_empty() {
            out.push_str("\n## Acceptance Criteria\n\n");
            for criterion in &self.acceptance_criteria {
                out.push_str(&format!("- [ ] {}\n", criterion));
            }
        }
        if !self.files.is_empty() {
            out.push_str("\n## Files\n\n");
            for file in &self.files {
                out.push_str(&format!("- `{}`\n", file.display()));
            }
        }
        out
    }
}
