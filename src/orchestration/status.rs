//! Read-only snapshots of a run.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::{DependencyGraph, TaskId, TaskState};

/// Number of tasks in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub verifying: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StateCounts {
    pub fn get(&self, state: TaskState) -> usize {
        match state {
            TaskState::Pending => self.pending,
            TaskState::Ready => self.ready,
            TaskState::Running => self.running,
            TaskState::Verifying => self.verifying,
            TaskState::Completed => self.completed,
            TaskState::Failed => self.failed,
            TaskState::Skipped => self.skipped,
        }
    }

    fn bump(&mut self, state: TaskState) {
        let slot = match state {
            TaskState::Pending => &mut self.pending,
            TaskState::Ready => &mut self.ready,
            TaskState::Running => &mut self.running,
            TaskState::Verifying => &mut self.verifying,
            TaskState::Completed => &mut self.completed,
            TaskState::Failed => &mut self.failed,
            TaskState::Skipped => &mut self.skipped,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.pending
            + self.ready
            + self.running
            + self.verifying
            + self.completed
            + self.failed
            + self.skipped
    }

    /// Tasks holding a pool slot.
    pub fn active(&self) -> usize {
        self.running + self.verifying
    }
}

/// A failed or skipped task and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub task: TaskId,
    pub name: String,
    pub state: TaskState,
    pub reason: String,
    /// Preserved workspace, when isolation was enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
}

/// Snapshot of every task's state.
///
/// Derived from the graph on demand; never a separate source of truth.
/// Once `finished` is set the snapshot is final.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub counts: StateCounts,
    pub failures: Vec<FailureReport>,
    pub tasks: Vec<TaskSummary>,
    pub finished: bool,
}

impl PoolStatus {
    pub fn from_graph(graph: &DependencyGraph, finished: bool) -> Self {
        let mut counts = StateCounts::default();
        let mut failures = Vec::new();
        let mut tasks = Vec::with_capacity(graph.len());

        for task in graph.tasks() {
            counts.bump(task.state);
            if matches!(task.state, TaskState::Failed | TaskState::Skipped) {
                failures.push(FailureReport {
                    task: task.id,
                    name: task.name.clone(),
                    state: task.state,
                    reason: task.error.clone().unwrap_or_else(|| task.state.to_string()),
                    workspace: if task.state == TaskState::Failed {
                        task.workspace.clone()
                    } else {
                        None
                    },
                });
            }
            tasks.push(TaskSummary {
                id: task.id,
                name: task.name.clone(),
                state: task.state,
                attempts: task.attempts,
                error: task.error.clone(),
                branch: task.branch.clone(),
                commit: task.commit.clone(),
                workspace: task.workspace.clone(),
            });
        }

        Self {
            counts,
            failures,
            tasks,
            finished,
        }
    }

    /// Every task reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.counts.completed + self.counts.failed + self.counts.skipped == self.counts.total()
    }

    /// Terminal with no `Failed` and no `Skipped` task.
    pub fn is_success(&self) -> bool {
        self.is_terminal() && self.counts.failed == 0 && self.counts.skipped == 0
    }

    pub fn failed_ids(&self) -> Vec<TaskId> {
        self.failures
            .iter()
            .filter(|f| f.state == TaskState::Failed)
            .map(|f| f.task)
            .collect()
    }

    pub fn skipped_ids(&self) -> Vec<TaskId> {
        self.failures
            .iter()
            .filter(|f| f.state == TaskState::Skipped)
            .map(|f| f.task)
            .collect()
    }

    pub fn state_of(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.iter().find(|t| t.id == id).map(|t| t.state)
    }
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = &self.counts;
        writeln!(
            f,
            "{}/{} completed, {} failed, {} skipped{}",
            c.completed,
            c.total(),
            c.failed,
            c.skipped,
            if c.active() + c.pending + c.ready > 0 {
                format!(", {} in progress", c.active() + c.pending + c.ready)
            } else {
                String::new()
            }
        )?;
        for task in &self.tasks {
            write!(f, "  {}  {:<10} {}", task.id, task.state.as_str(), task.name)?;
            if let Some(error) = &task.error {
                write!(f, " ({})", error)?;
            }
            writeln!(f)?;
        }
        for failure in self.failures.iter().filter(|f| f.workspace.is_some()) {
            if let Some(path) = &failure.workspace {
                writeln!(f, "  task {} workspace kept at {}", failure.task, path.display())?;
            }
        }
        Ok(())
    }
}
