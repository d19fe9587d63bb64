//! Resume record persisted as `execution-status.json`.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{DependencyGraph, TaskId, TaskRecord, TaskState};
use crate::orchestration::PoolStatus;
use crate::util::blocking;
use crate::{elog_debug, Result};

pub const STATUS_FILENAME: &str = "execution-status.json";

const RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// What happened during the latest run of an epic.
///
/// Only `Completed` entries matter for resuming: their tasks are handed to
/// the next run as already done. Everything else is informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub version: u32,
    pub run_id: Uuid,
    pub epic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_branch: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

impl ExecutionRecord {
    pub fn new(epic: &str, target_branch: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            version: RECORD_VERSION,
            run_id: Uuid::new_v4(),
            epic: epic.to_string(),
            target_branch,
            started_at: now,
            updated_at: now,
            finished: false,
            tasks: Vec::new(),
        }
    }

    /// Record location inside `dir`.
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(STATUS_FILENAME)
    }

    /// Load a record; `None` if the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        elog_debug!("ExecutionRecord::load path={}", path.display());
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Write through a temp file, keeping the previous version as `.bak`.
    pub fn save_sync(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        if path.exists() {
            fs::copy(path, path.with_extension("json.bak"))?;
        }
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, serde_json::to_string_pretty(self)?)?;
        fs::rename(&temp_path, path)?;
        elog_debug!("Execution record saved: {}", path.display());
        Ok(())
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let record = self.clone();
        let path = path.to_path_buf();
        blocking(move || record.save_sync(&path)).await
    }

    pub fn entry(&self, id: TaskId) -> Option<&TaskEntry> {
        self.tasks.iter().find(|t| t.id == id)
    }

    fn entry_mut(&mut self, id: TaskId, name: &str) -> &mut TaskEntry {
        let index = match self.tasks.iter().position(|t| t.id == id) {
            Some(index) => index,
            None => {
                self.tasks.push(TaskEntry {
                    id,
                    name: name.to_string(),
                    state: TaskState::Pending,
                    attempts: 0,
                    error: None,
                    branch: None,
                    commit: None,
                    workspace: None,
                    started_at: None,
                    completed_at: None,
                });
                self.tasks.sort_by_key(|t| t.id);
                self.tasks.iter().position(|t| t.id == id).unwrap_or(0)
            }
        };
        &mut self.tasks[index]
    }

    /// Copy every task's state out of the graph.
    pub fn update_from_graph(&mut self, graph: &DependencyGraph, finished: bool) {
        for task in graph.tasks() {
            let entry = self.entry_mut(task.id, &task.name);
            entry.state = task.state;
            entry.attempts = task.attempts;
            entry.error = task.error.clone();
            entry.branch = task.branch.clone();
            entry.commit = task.commit.clone();
            entry.workspace = task.workspace.clone();
            entry.started_at = task.started_at.or(entry.started_at);
            entry.completed_at = task.completed_at.or(entry.completed_at);
        }
        self.finished = finished;
        self.updated_at = Utc::now();
    }

    /// Fold a live pool snapshot into the record.
    pub fn update_from_status(&mut self, status: &PoolStatus) {
        let now = Utc::now();
        for task in &status.tasks {
            let entry = self.entry_mut(task.id, &task.name);
            entry.state = task.state;
            entry.attempts = task.attempts;
            entry.error = task.error.clone();
            entry.branch = task.branch.clone();
            entry.commit = task.commit.clone();
            entry.workspace = task.workspace.clone();
            if task.state.is_active() && entry.started_at.is_none() {
                entry.started_at = Some(now);
            }
            if task.state.is_terminal() && entry.completed_at.is_none() {
                entry.completed_at = Some(now);
            }
        }
        self.finished = status.finished;
        self.updated_at = now;
    }

    pub fn completed_tasks(&self) -> BTreeSet<TaskId> {
        self.ids_in(TaskState::Completed)
    }

    pub fn failed_tasks(&self) -> BTreeSet<TaskId> {
        self.ids_in(TaskState::Failed)
    }

    fn ids_in(&self, state: TaskState) -> BTreeSet<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.state == state)
            .map(|t| t.id)
            .collect()
    }

    /// Mark records completed by this run as `Completed` for a resumed run.
    ///
    /// Returns the ids that were marked.
    pub fn apply_completed(&self, records: &mut [TaskRecord]) -> Vec<TaskId> {
        let done = self.completed_tasks();
        let mut marked = Vec::new();
        for record in records.iter_mut().filter(|r| done.contains(&r.id)) {
            record.state = TaskState::Completed;
            if let Some(entry) = self.entry(record.id) {
                record.commit = entry.commit.clone();
                record.branch = entry.branch.clone();
            }
            marked.push(record.id);
        }
        marked
    }
}

impl std::fmt::Display for ExecutionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Epic: {}", self.epic)?;
        writeln!(f, "Run: {}", self.run_id)?;
        if let Some(branch) = &self.target_branch {
            writeln!(f, "Target branch: {}", branch)?;
        }
        writeln!(
            f,
            "Started: {}  Updated: {}{}",
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.updated_at.format("%Y-%m-%d %H:%M:%S"),
            if self.finished { "  (finished)" } else { "" }
        )?;
        for task in &self.tasks {
            write!(f, "  {}  {:<10} {}", task.id, task.state.as_str(), task.name)?;
            if let Some(commit) = &task.commit {
                write!(f, " [{:.8}]", commit)?;
            }
            if let Some(error) = &task.error {
                write!(f, " ({})", error)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
