//! Static execution plan for display and pre-flight validation.
//!
//! The plan groups tasks into levels with Kahn's algorithm. It is purely
//! informational: the pool admits tasks from the graph's live readiness
//! tracker, so a task never waits for unrelated tasks of an earlier level.

use crate::core::{DependencyGraph, TaskId, TaskState};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Tasks batched by dependency depth.
///
/// Every dependency of a task in level `k` lies in a level `< k` (or was
/// already completed by an earlier run). Within a level ids are ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub levels: Vec<Vec<TaskId>>,
}

/// Two tasks in the same level that declare a shared file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileConflict {
    pub level: usize,
    pub first: TaskId,
    pub second: TaskId,
    pub files: Vec<PathBuf>,
}

impl std::fmt::Display for FileConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let files: Vec<String> = self.files.iter().map(|p| p.display().to_string()).collect();
        write!(
            f,
            "Level {}: tasks {} and {} both touch {}",
            self.level,
            self.first,
            self.second,
            files.join(", ")
        )
    }
}

/// Build the level plan for every task that is not already `Completed`.
///
/// Completed tasks are left out of the plan but still count as satisfied
/// dependencies for the tasks that remain.
pub fn compute_plan(graph: &DependencyGraph) -> ExecutionPlan {
    let mut remaining: HashMap<TaskId, usize> = graph
        .tasks()
        .into_iter()
        .filter(|t| t.state != TaskState::Completed)
        .map(|t| {
            let open = graph
                .dependencies(&t.id)
                .iter()
                .filter(|dep| graph.state(dep) != Some(TaskState::Completed))
                .count();
            (t.id, open)
        })
        .collect();

    let mut levels = Vec::new();
    let mut current: Vec<TaskId> = remaining
        .iter()
        .filter(|(_, open)| **open == 0)
        .map(|(id, _)| *id)
        .collect();
    current.sort();

    while !current.is_empty() {
        let mut next = Vec::new();
        for id in &current {
            remaining.remove(id);
            for dependent in graph.dependents(id) {
                if let Some(open) = remaining.get_mut(&dependent) {
                    *open -= 1;
                    if *open == 0 {
                        next.push(dependent);
                    }
                }
            }
        }
        next.sort();
        levels.push(std::mem::replace(&mut current, next));
    }

    ExecutionPlan { levels }
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn task_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Widest level, i.e. the most tasks that could ever run at once.
    pub fn max_parallelism(&self) -> usize {
        self.levels.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn level_of(&self, id: &TaskId) -> Option<usize> {
        self.levels.iter().position(|level| level.contains(id))
    }

    /// Same-level task pairs whose declared `files` overlap.
    ///
    /// Sequencing is not changed; the report only warns that their branches
    /// are likely to conflict on integration.
    pub fn file_conflicts(&self, graph: &DependencyGraph) -> Vec<FileConflict> {
        let mut conflicts = Vec::new();
        for (level, ids) in self.levels.iter().enumerate() {
            let mut owners: BTreeMap<&PathBuf, Vec<TaskId>> = BTreeMap::new();
            for id in ids {
                if let Some(task) = graph.get(id) {
                    for file in &task.files {
                        owners.entry(file).or_default().push(*id);
                    }
                }
            }

            let mut pairs: BTreeMap<(TaskId, TaskId), Vec<PathBuf>> = BTreeMap::new();
            for (file, tasks) in owners {
                for (i, first) in tasks.iter().enumerate() {
                    for second in &tasks[i + 1..] {
                        if first != second {
                            let key = (*first.min(second), *first.max(second));
                            pairs.entry(key).or_default().push(file.clone());
                        }
                    }
                }
            }

            conflicts.extend(pairs.into_iter().map(|((first, second), files)| FileConflict {
                level,
                first,
                second,
                files,
            }));
        }
        conflicts
    }
}

impl std::fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.levels.is_empty() {
            return writeln!(f, "Nothing to do: all tasks completed");
        }
        for (i, level) in self.levels.iter().enumerate() {
            let ids: Vec<String> = level.iter().map(|id| id.to_string()).collect();
            writeln!(f, "Level {}: {}", i, ids.join(", "))?;
        }
        Ok(())
    }
}
