use std::path::{Path, PathBuf};

use git2::{
    BranchType, ErrorCode, IndexAddOption, Repository, Signature, StatusOptions,
    WorktreeAddOptions, WorktreePruneOptions,
};

use crate::{elog_debug, elog_warn, Error, Result};

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        elog_debug!("GitOps::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Root of the main working tree.
    pub fn workdir(&self) -> Result<PathBuf> {
        let repo = self.repo()?;
        repo.workdir()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::Workspace("repository has no working tree".to_string()))
    }

    pub fn head_commit(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?;
        let commit = head.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Branch checked out in the main working tree, `None` when detached.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let repo = self.repo()?;
        let head = repo.head()?;
        if head.is_branch() {
            return Ok(head.shorthand().map(String::from));
        }
        Ok(None)
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let result = repo.find_branch(branch, BranchType::Local);
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn branch_tip(&self, branch: &str) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo
            .find_branch(branch, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Create `branch` at HEAD unless it already exists. Returns true if created.
    pub fn ensure_branch(&self, branch: &str) -> Result<bool> {
        if self.branch_exists(branch)? {
            return Ok(false);
        }
        let repo = self.repo()?;
        let head = repo.head()?.peel_to_commit()?;
        elog_debug!("Creating branch {} from commit {}", branch, head.id());
        repo.branch(branch, &head, false)?;
        Ok(true)
    }

    /// Create `branch` from the tip of `base` and check it out in a new
    /// worktree at `worktree_path`.
    pub fn create_worktree(&self, branch: &str, worktree_path: &Path, base: &str) -> Result<()> {
        elog_debug!(
            "GitOps::create_worktree branch={} base={} path={}",
            branch,
            base,
            worktree_path.display()
        );
        let repo = self.repo()?;
        let base_commit = repo
            .find_branch(base, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        let branch_obj = repo.branch(branch, &base_commit, false)?;
        let branch_ref = branch_obj.into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Branch names contain slashes; the folder name is a safe worktree name
        let worktree_name = worktree_name(worktree_path, branch);
        repo.worktree(&worktree_name, worktree_path, Some(&opts))?;
        elog_debug!("Worktree created: {}", worktree_name);
        Ok(())
    }

    /// Attach a new worktree to an existing branch.
    pub fn create_worktree_from_branch(&self, branch: &str, worktree_path: &Path) -> Result<()> {
        elog_debug!(
            "GitOps::create_worktree_from_branch branch={} path={}",
            branch,
            worktree_path.display()
        );
        let repo = self.repo()?;
        let reference = repo.find_branch(branch, BranchType::Local)?.into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        let worktree_name = worktree_name(worktree_path, branch);
        // A stale admin dir from a deleted worktree blocks re-adding the name
        self.prune_stale_worktrees();
        repo.worktree(&worktree_name, worktree_path, Some(&opts))?;
        Ok(())
    }

    /// Path of the linked worktree that has `branch` checked out, if any.
    pub fn worktree_for_branch(&self, branch: &str) -> Result<Option<PathBuf>> {
        let repo = self.repo()?;
        for name in repo.worktrees()?.iter().flatten() {
            let Ok(worktree) = repo.find_worktree(name) else {
                continue;
            };
            if !worktree.path().exists() {
                continue;
            }
            let Ok(wt_repo) = Repository::open(worktree.path()) else {
                continue;
            };
            let checked_out = wt_repo
                .head()
                .ok()
                .filter(|h| h.is_branch())
                .and_then(|h| h.shorthand().map(String::from));
            if checked_out.as_deref() == Some(branch) {
                return Ok(Some(worktree.path().to_path_buf()));
            }
        }
        Ok(None)
    }

    pub fn is_checked_out_in_main(&self, branch: &str) -> Result<bool> {
        Ok(self.current_branch()?.as_deref() == Some(branch))
    }

    /// Remove a worktree and its admin directory. The branch is kept.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        elog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        let canonical = worktree_path.canonicalize().ok();
        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from);

        // Match by path first (canonicalized, tempdirs may be symlinked),
        // fall back to folder name
        let found: Option<String> = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| {
                        wt.path() == worktree_path
                            || (canonical.is_some() && wt.path().canonicalize().ok() == canonical)
                    })
                    .unwrap_or(false)
            })
            .map(String::from)
            .or_else(|| {
                folder_name.as_ref().and_then(|fname| {
                    worktrees
                        .iter()
                        .flatten()
                        .find(|name| *name == fname.as_str())
                        .map(String::from)
                })
            });

        if let Some(ref name) = found {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(&mut prune_options())) {
                    elog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        // If the admin dir survives, git still considers the branch checked out
        if let Some(ref name) = found {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                elog_debug!("Cleaning up worktree admin dir: {}", admin_dir.display());
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }

        Ok(())
    }

    /// Stage everything (respecting .gitignore) and commit on the worktree's
    /// HEAD. Returns the new commit id, or `None` when there was nothing to
    /// commit.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<Option<String>> {
        elog_debug!(
            "GitOps::commit_all path={} message={}",
            worktree_path.display(),
            message
        );
        let repo = Repository::open(worktree_path)?;
        if !has_changes(&repo)? {
            elog_debug!("Nothing to commit in {}", worktree_path.display());
            return Ok(None);
        }

        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["."].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = signature(&repo)?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };

        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        elog_debug!("Commit created: {}", commit_id);
        Ok(Some(commit_id.to_string()))
    }

    /// Paths with uncommitted changes (including untracked files).
    pub fn changed_files(&self, worktree_path: &Path) -> Result<Vec<PathBuf>> {
        let repo = Repository::open(worktree_path)?;
        let statuses = repo.statuses(Some(&mut status_options()))?;
        let mut files: Vec<PathBuf> = statuses
            .iter()
            .filter_map(|entry| entry.path().map(PathBuf::from))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Move `target` to the tip of `source` if that is a fast-forward.
    pub fn fast_forward(&self, target: &str, source: &str) -> Result<String> {
        elog_debug!("GitOps::fast_forward target={} source={}", target, source);
        let repo = self.repo()?;
        let target_commit = repo
            .find_branch(target, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        let source_commit = repo
            .find_branch(source, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;

        if target_commit.id() == source_commit.id()
            || repo.graph_descendant_of(target_commit.id(), source_commit.id())?
        {
            return Ok(target_commit.id().to_string());
        }
        if !repo.graph_descendant_of(source_commit.id(), target_commit.id())? {
            return Err(Error::Workspace(format!(
                "cannot fast-forward {} to {}: branches have diverged",
                target, source
            )));
        }

        repo.reference(
            &format!("refs/heads/{}", target),
            source_commit.id(),
            true,
            &format!("fast-forward to {}", source),
        )?;
        Ok(source_commit.id().to_string())
    }

    /// Merge `source` into `target` without touching any working tree.
    ///
    /// Fast-forwards when possible; otherwise writes a merge commit from an
    /// in-memory index. Conflicts are reported as a workspace error listing
    /// the conflicting paths and leave `target` unchanged.
    pub fn merge_into(&self, target: &str, source: &str, message: &str) -> Result<String> {
        elog_debug!("GitOps::merge_into target={} source={}", target, source);
        let repo = self.repo()?;
        let target_commit = repo
            .find_branch(target, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        let source_commit = repo
            .find_branch(source, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;

        if target_commit.id() == source_commit.id()
            || repo.graph_descendant_of(target_commit.id(), source_commit.id())?
        {
            return Ok(target_commit.id().to_string());
        }
        if repo.graph_descendant_of(source_commit.id(), target_commit.id())? {
            return self.fast_forward(target, source);
        }

        let mut index = repo.merge_commits(&target_commit, &source_commit, None)?;
        if index.has_conflicts() {
            let mut paths: Vec<String> = index
                .conflicts()?
                .flatten()
                .filter_map(|c| {
                    c.our
                        .as_ref()
                        .or(c.their.as_ref())
                        .or(c.ancestor.as_ref())
                        .map(|e| String::from_utf8_lossy(&e.path).to_string())
                })
                .collect();
            paths.sort();
            paths.dedup();
            return Err(Error::Workspace(format!(
                "merge of {} into {} has conflicts: {}",
                source,
                target,
                paths.join(", ")
            )));
        }

        let tree_id = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_id)?;
        let sig = signature(&repo)?;
        let commit_id = repo.commit(
            Some(&format!("refs/heads/{}", target)),
            &sig,
            &sig,
            message,
            &tree,
            &[&target_commit, &source_commit],
        )?;
        elog_debug!("Merge commit created: {}", commit_id);
        Ok(commit_id.to_string())
    }

    /// Prune admin entries of worktrees whose directories are gone.
    pub fn prune_stale_worktrees(&self) -> usize {
        let Ok(repo) = self.repo() else {
            return 0;
        };
        let Ok(worktrees) = repo.worktrees() else {
            return 0;
        };
        let mut pruned = 0;
        for name in worktrees.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                if !wt.path().exists() && wt.prune(Some(&mut prune_options())).is_ok() {
                    elog_debug!("Pruned stale worktree reference: {}", name);
                    pruned += 1;
                }
            }
        }
        pruned
    }
}

fn worktree_name(worktree_path: &Path, branch: &str) -> String {
    worktree_path
        .file_name()
        .and_then(|n| n.to_str())
        .map(String::from)
        .unwrap_or_else(|| branch.replace('/', "-"))
}

fn prune_options() -> WorktreePruneOptions {
    let mut opts = WorktreePruneOptions::new();
    opts.valid(true).working_tree(true).locked(true);
    opts
}

fn status_options() -> StatusOptions {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false);
    opts
}

fn has_changes(repo: &Repository) -> Result<bool> {
    Ok(!repo.statuses(Some(&mut status_options()))?.is_empty())
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    Ok(repo
        .signature()
        .or_else(|_| Signature::now("Epic Executor", "epic-executor@localhost"))?)
}
