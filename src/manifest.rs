//! Epic manifests: the task list handed to the executor.
//!
//! ```toml
//! epic = "user-auth"
//!
//! [[tasks]]
//! id = 1
//! name = "Database schema"
//! acceptance_criteria = ["migration applies cleanly"]
//!
//! [[tasks]]
//! id = 2
//! name = "Login endpoint"
//! depends_on = [1]
//! files = ["src/api/login.rs"]
//! ```
//!
//! The same structure is accepted as JSON when the file ends in `.json`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::{DependencyGraph, TaskRecord};
use crate::state::ExecutionRecord;
use crate::{elog_debug, Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpicManifest {
    pub epic: String,
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
}

impl EpicManifest {
    pub fn load(path: &Path) -> Result<Self> {
        elog_debug!("EpicManifest::load path={}", path.display());
        let contents = fs::read_to_string(path)?;
        let manifest: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") => toml::from_str(&contents)?,
            _ => {
                return Err(Error::Validation(format!(
                    "unsupported manifest format: {} (expected .toml or .json)",
                    path.display()
                )))
            }
        };
        if manifest.epic.trim().is_empty() {
            return Err(Error::Validation("manifest has an empty epic name".to_string()));
        }
        elog_debug!(
            "Manifest loaded: epic={}, tasks={}",
            manifest.epic,
            manifest.tasks.len()
        );
        Ok(manifest)
    }

    /// Where the resume record for this manifest lives.
    pub fn record_path(manifest_path: &Path) -> PathBuf {
        let dir = manifest_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        ExecutionRecord::path_in(dir)
    }

    /// Build the dependency graph, treating tasks completed by an earlier run
    /// as already done.
    pub fn into_graph(self, resume: Option<&ExecutionRecord>) -> Result<DependencyGraph> {
        let mut tasks = self.tasks;
        if let Some(record) = resume {
            let marked = record.apply_completed(&mut tasks);
            elog_debug!("Resuming with {} completed task(s)", marked.len());
        }
        DependencyGraph::build(tasks)
    }
}
