//! Git worktree per task.
//!
//! Every task gets its own branch `epic/<slug>-task-<NNN>` checked out in
//! `<worktree_dir>/<slug>-task-<NNN>`. Names are derived from the epic and the
//! task id only, so a re-run finds the same branch and directory again.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::deps::copy_dependencies;
use super::{ReleaseOutcome, ReleaseReport, Workspace, WorkspaceProvider};
use crate::core::{TaskId, TaskRecord};
use crate::git::GitOps;
use crate::util::{blocking, slugify};
use crate::{elog_debug, elog_warn, Error, Result};

/// What happens to a task branch after the task completes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStrategy {
    /// Leave the task branch standalone for later review.
    ///
    /// The target branch never moves, so a dependent task starts without
    /// its dependencies' work. Use `Merge` or `FastForward` when tasks
    /// build on each other.
    #[default]
    Branch,
    /// Advance the target branch to the task tip; fails if they diverged.
    FastForward,
    /// Merge the task branch into the target branch with a merge commit.
    Merge,
}

impl std::fmt::Display for IntegrationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IntegrationStrategy::Branch => "branch",
            IntegrationStrategy::FastForward => "fast_forward",
            IntegrationStrategy::Merge => "merge",
        };
        f.write_str(name)
    }
}

/// Settings for [`WorktreeManager`].
#[derive(Debug, Clone)]
pub struct WorktreeSettings {
    pub epic: String,
    pub worktree_dir: PathBuf,
    pub integration: IntegrationStrategy,
    /// Defaults to `epic/<slug>`.
    pub target_branch: Option<String>,
    pub copy_patterns: Vec<String>,
}

/// Workspace provider backed by git worktrees.
///
/// All git work happens on the blocking pool. The pool calls `acquire` and
/// `release` from its single event loop, so git operations on the shared
/// repository never overlap.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    slug: String,
    worktree_dir: PathBuf,
    integration: IntegrationStrategy,
    target_branch: String,
    copy_patterns: Vec<String>,
}

impl WorktreeManager {
    pub fn new(repo_path: &Path, settings: WorktreeSettings) -> Result<Self> {
        let git = GitOps::new(repo_path)?;
        let repo_path = git.workdir()?;
        let slug = slugify(&settings.epic);
        let target_branch = settings
            .target_branch
            .unwrap_or_else(|| format!("epic/{}", slug));
        elog_debug!(
            "WorktreeManager::new repo={} target={} integration={}",
            repo_path.display(),
            target_branch,
            settings.integration
        );
        Ok(Self {
            repo_path,
            slug,
            worktree_dir: settings.worktree_dir,
            integration: settings.integration,
            target_branch,
            copy_patterns: settings.copy_patterns,
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn target_branch(&self) -> &str {
        &self.target_branch
    }

    pub fn integration(&self) -> IntegrationStrategy {
        self.integration
    }

    pub fn branch_name(&self, id: TaskId) -> String {
        format!("epic/{}-task-{}", self.slug, id)
    }

    pub fn worktree_path(&self, id: TaskId) -> PathBuf {
        self.worktree_dir.join(format!("{}-task-{}", self.slug, id))
    }

    fn acquire_blocking(&self, task: &TaskRecord) -> Result<Workspace> {
        let git = GitOps::new(&self.repo_path)?;
        if git.ensure_branch(&self.target_branch)? {
            elog_debug!("Created target branch {}", self.target_branch);
        }

        let branch = self.branch_name(task.id);
        let path = self.worktree_path(task.id);

        if git.is_checked_out_in_main(&branch)? {
            return Err(Error::Workspace(format!(
                "branch {} is checked out in the main working tree",
                branch
            )));
        }

        let is_new = match git.worktree_for_branch(&branch)? {
            Some(existing) if same_path(&existing, &path) => {
                elog_debug!("Reusing worktree {} for task {}", path.display(), task.id);
                false
            }
            Some(existing) => {
                return Err(Error::Workspace(format!(
                    "branch {} is already checked out at {}",
                    branch,
                    existing.display()
                )));
            }
            None => {
                if path.exists() {
                    return Err(Error::Workspace(format!(
                        "{} exists but is not a worktree of branch {}",
                        path.display(),
                        branch
                    )));
                }
                std::fs::create_dir_all(&self.worktree_dir)?;
                if git.branch_exists(&branch)? {
                    git.create_worktree_from_branch(&branch, &path)?;
                } else {
                    git.create_worktree(&branch, &path, &self.target_branch)?;
                }
                true
            }
        };

        if is_new {
            let copied = copy_dependencies(&self.repo_path, &path, &self.copy_patterns);
            if !copied.is_empty() {
                elog_debug!("Copied {} dependencies for task {}", copied.len(), task.id);
            }
        }

        Ok(Workspace {
            task: task.id,
            path,
            base_commit: Some(git.branch_tip(&branch)?),
            branch: Some(branch),
            is_new,
            isolated: true,
        })
    }

    fn release_blocking(
        &self,
        task: &TaskRecord,
        workspace: &Workspace,
        outcome: ReleaseOutcome,
    ) -> Result<ReleaseReport> {
        if outcome == ReleaseOutcome::Failure {
            elog_warn!(
                "Preserving worktree of task {} at {}",
                task.id,
                workspace.path.display()
            );
            return Ok(ReleaseReport {
                preserved: Some(workspace.path.clone()),
                ..ReleaseReport::default()
            });
        }

        let git = GitOps::new(&self.repo_path)?;
        let branch = workspace
            .branch
            .clone()
            .unwrap_or_else(|| self.branch_name(task.id));

        let message = format!("task {}: {}", task.id, task.name);
        if let Some(commit) = git.commit_all(&workspace.path, &message)? {
            elog_debug!("Committed pending work of task {}: {}", task.id, commit);
        }
        let commit = git.branch_tip(&branch)?;

        let integrated = self.integrate(&git, task, &branch)?;

        let mut report = ReleaseReport {
            commit: Some(commit),
            integrated,
            preserved: None,
        };
        if let Err(e) = git.remove_worktree(&workspace.path) {
            elog_warn!(
                "Failed to remove worktree {}: {}",
                workspace.path.display(),
                e
            );
            report.preserved = Some(workspace.path.clone());
        }
        Ok(report)
    }

    fn integrate(&self, git: &GitOps, task: &TaskRecord, branch: &str) -> Result<Option<String>> {
        if self.integration == IntegrationStrategy::Branch {
            return Ok(None);
        }
        if git.is_checked_out_in_main(&self.target_branch)? {
            return Err(Error::Workspace(format!(
                "refusing to move {}: it is checked out in the main working tree",
                self.target_branch
            )));
        }
        if let Some(path) = git.worktree_for_branch(&self.target_branch)? {
            return Err(Error::Workspace(format!(
                "refusing to move {}: it is checked out at {}",
                self.target_branch,
                path.display()
            )));
        }

        let tip = match self.integration {
            IntegrationStrategy::FastForward => git.fast_forward(&self.target_branch, branch)?,
            IntegrationStrategy::Merge => git.merge_into(
                &self.target_branch,
                branch,
                &format!("Merge task {}: {}", task.id, task.name),
            )?,
            IntegrationStrategy::Branch => return Ok(None),
        };
        elog_debug!(
            "Integrated {} into {} ({}) at {}",
            branch,
            self.target_branch,
            self.integration,
            tip
        );
        Ok(Some(tip))
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[async_trait]
impl WorkspaceProvider for WorktreeManager {
    async fn acquire(&self, task: &TaskRecord) -> Result<Workspace> {
        let manager = self.clone();
        let task = task.clone();
        blocking(move || manager.acquire_blocking(&task)).await
    }

    async fn release(
        &self,
        task: &TaskRecord,
        workspace: &Workspace,
        outcome: ReleaseOutcome,
    ) -> Result<ReleaseReport> {
        let manager = self.clone();
        let task = task.clone();
        let workspace = workspace.clone();
        blocking(move || manager.release_blocking(&task, &workspace, outcome)).await
    }
}
