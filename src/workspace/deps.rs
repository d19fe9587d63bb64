//! Copy git-ignored dependency directories into fresh worktrees.
//!
//! A new worktree only contains tracked files, so installed dependencies
//! (`node_modules`, virtualenvs) and local env files are missing. Collaborators
//! usually need them to build or test, so they are copied over from the main
//! working tree once, when the worktree is created.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};

use crate::{elog_debug, elog_warn};

/// Names copied into new worktrees unless configured otherwise.
pub const DEFAULT_COPY_PATTERNS: &[&str] = &[
    "node_modules",
    ".env",
    "dist",
    ".next",
    "build",
    "__pycache__",
    ".venv",
    "venv",
];

/// Directories searched for patterns: the root and two levels below.
const SEARCH_DEPTH: usize = 2;

/// Paths under `repo_root` whose file name matches one of `patterns`.
///
/// Hidden directories and matched directories themselves are not descended
/// into, so `node_modules/*/node_modules` is never reported separately.
pub fn find_dependencies(repo_root: &Path, patterns: &[String]) -> Vec<PathBuf> {
    let searchable = |entry: &DirEntry| {
        if entry.depth() == 0 {
            return true;
        }
        let name = entry.file_name().to_string_lossy();
        entry.file_type().is_dir()
            && !name.starts_with('.')
            && !patterns.iter().any(|p| p.as_str() == name)
    };

    let mut found: Vec<PathBuf> = WalkDir::new(repo_root)
        .max_depth(SEARCH_DEPTH)
        .follow_links(false)
        .into_iter()
        .filter_entry(searchable)
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .flat_map(|dir| {
            patterns
                .iter()
                .map(|p| dir.path().join(p))
                .filter(|candidate| fs::symlink_metadata(candidate).is_ok())
                .collect::<Vec<_>>()
        })
        .collect();
    found.sort();
    found.dedup();
    found
}

/// Copy matched dependencies into `worktree`, skipping ones already present.
///
/// Returns the copied paths relative to `repo_root`. Individual copy
/// failures are logged and skipped.
pub fn copy_dependencies(repo_root: &Path, worktree: &Path, patterns: &[String]) -> Vec<PathBuf> {
    let mut copied = Vec::new();
    for source in find_dependencies(repo_root, patterns) {
        let Ok(relative) = source.strip_prefix(repo_root) else {
            continue;
        };
        let target = worktree.join(relative);
        if fs::symlink_metadata(&target).is_ok() {
            continue;
        }
        match copy_path(&source, &target) {
            Ok(()) => {
                elog_debug!("Copied dependency {} into worktree", relative.display());
                copied.push(relative.to_path_buf());
            }
            Err(e) => {
                elog_warn!("Failed to copy {} into worktree: {}", relative.display(), e);
            }
        }
    }
    copied
}

fn copy_path(source: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let meta = fs::symlink_metadata(source)?;
    if meta.file_type().is_symlink() {
        return copy_symlink(source, target);
    }
    if meta.is_file() {
        fs::copy(source, target)?;
        return Ok(());
    }

    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let dest = target.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&dest)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(source: &Path, target: &Path) -> io::Result<()> {
    let link = fs::read_link(source)?;
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, target: &Path) -> io::Result<()> {
    fs::copy(source, target).map(|_| ())
}
