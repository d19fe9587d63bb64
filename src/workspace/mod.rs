//! Isolated working copies for running tasks.
//!
//! A [`WorkspaceProvider`] hands out one [`Workspace`] per task for its whole
//! Running + Verifying lifetime and reclaims it afterwards. The git-backed
//! [`WorktreeManager`] gives every task its own worktree and branch;
//! [`SharedWorkspace`] is the degenerate provider used when isolation is
//! turned off.

mod deps;
mod worktree;

pub use deps::{copy_dependencies, find_dependencies, DEFAULT_COPY_PATTERNS};
pub use worktree::{IntegrationStrategy, WorktreeManager, WorktreeSettings};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{TaskId, TaskRecord};
use crate::Result;

/// An exclusively owned working directory bound to one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub task: TaskId,
    pub path: PathBuf,
    /// Task branch, `None` for the shared working directory.
    pub branch: Option<String>,
    /// Branch tip when the workspace was handed out.
    pub base_commit: Option<String>,
    /// False when an existing worktree from an earlier run was reused.
    pub is_new: bool,
    pub isolated: bool,
}

/// How the task left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    Failure,
}

/// What `release` did with a workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    /// Tip of the task branch after committing pending work.
    pub commit: Option<String>,
    /// Tip of the target branch after integration.
    pub integrated: Option<String>,
    /// Set when the workspace was kept on disk for inspection.
    pub preserved: Option<PathBuf>,
}

/// Provisions and reclaims workspaces.
///
/// On success `release` integrates the task's work and deletes the
/// workspace. On failure it keeps the workspace and reports its path.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// # Errors
    /// `Error::Workspace` (or a wrapped git/io error) if the workspace cannot
    /// be created. Fatal to this task only.
    async fn acquire(&self, task: &TaskRecord) -> Result<Workspace>;

    async fn release(
        &self,
        task: &TaskRecord,
        workspace: &Workspace,
        outcome: ReleaseOutcome,
    ) -> Result<ReleaseReport>;
}

/// No isolation: every task runs in the same directory.
///
/// Concurrent tasks would see each other's changes, so callers must run
/// the pool with a concurrency of 1.
#[derive(Debug, Clone)]
pub struct SharedWorkspace {
    dir: PathBuf,
}

impl SharedWorkspace {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl WorkspaceProvider for SharedWorkspace {
    async fn acquire(&self, task: &TaskRecord) -> Result<Workspace> {
        Ok(Workspace {
            task: task.id,
            path: self.dir.clone(),
            branch: None,
            base_commit: None,
            is_new: false,
            isolated: false,
        })
    }

    async fn release(
        &self,
        _task: &TaskRecord,
        _workspace: &Workspace,
        _outcome: ReleaseOutcome,
    ) -> Result<ReleaseReport> {
        Ok(ReleaseReport::default())
    }
}
