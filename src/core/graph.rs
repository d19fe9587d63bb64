//! Dependency graph over task records.
//!
//! The graph is validated once at construction (unknown dependencies,
//! duplicate ids, cycles) and afterwards only changes through the readiness
//! operations: [`DependencyGraph::mark_completed`] unlocks dependents and
//! [`DependencyGraph::mark_failed`] skips the failed task's whole subtree.
//! It performs no I/O.

use crate::core::task::{TaskId, TaskRecord, TaskState};
use crate::error::{Error, Result};
use chrono::Utc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// The task dependency graph.
///
/// Nodes are task records; an edge `a -> b` means `b` depends on `a`.
/// Alongside the petgraph structure we keep, per task, the number of
/// dependencies that have not reached `Completed` yet. A pending task whose
/// count drops to zero becomes `Ready`.
pub struct DependencyGraph {
    graph: DiGraph<TaskRecord, ()>,
    index: HashMap<TaskId, NodeIndex>,
    in_degree: HashMap<TaskId, usize>,
}

impl DependencyGraph {
    /// Build and validate a graph from task records.
    ///
    /// Records arriving as `Completed` (from an earlier partial run) keep that
    /// state and count as satisfied dependencies. Every other record is reset
    /// to `Pending` so that failed or interrupted work is attempted again.
    ///
    /// # Errors
    /// - `DuplicateTask` if two records share an id
    /// - `UnknownDependency` if a dependency id is not among the records
    /// - `Cycle` if the dependency relation is cyclic (self-dependencies
    ///   included)
    pub fn build(records: Vec<TaskRecord>) -> Result<Self> {
        let mut records = records;
        records.sort_by_key(|r| r.id);

        let mut graph = DiGraph::with_capacity(records.len(), records.len());
        let mut index = HashMap::with_capacity(records.len());

        for mut record in records {
            if index.contains_key(&record.id) {
                return Err(Error::DuplicateTask(record.id));
            }
            if record.state != TaskState::Completed {
                record.state = TaskState::Pending;
                record.error = None;
                record.attempts = 0;
            }
            let id = record.id;
            let node = graph.add_node(record);
            index.insert(id, node);
        }

        let mut edges = Vec::new();
        for node in graph.node_indices() {
            let task = &graph[node];
            let deps: BTreeSet<TaskId> = task.depends_on.iter().copied().collect();
            for dep in deps {
                let Some(&dep_node) = index.get(&dep) else {
                    return Err(Error::UnknownDependency {
                        task: task.id,
                        dependency: dep,
                    });
                };
                if dep == task.id {
                    return Err(Error::Cycle {
                        tasks: vec![task.id],
                    });
                }
                edges.push((dep_node, node));
            }
        }
        for (from, to) in edges {
            graph.add_edge(from, to, ());
        }

        let mut dag = Self {
            graph,
            index,
            in_degree: HashMap::new(),
        };
        dag.check_acyclic()?;

        let in_degree = dag
            .graph
            .node_indices()
            .map(|node| {
                let unsatisfied = dag
                    .graph
                    .neighbors_directed(node, Direction::Incoming)
                    .filter(|dep| dag.graph[*dep].state != TaskState::Completed)
                    .count();
                (dag.graph[node].id, unsatisfied)
            })
            .collect();
        dag.in_degree = in_degree;

        Ok(dag)
    }

    /// Kahn reduction: the graph is acyclic iff repeatedly removing
    /// zero-in-degree nodes removes every node.
    fn check_acyclic(&self) -> Result<()> {
        let mut remaining: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| {
                (
                    n,
                    self.graph.neighbors_directed(n, Direction::Incoming).count(),
                )
            })
            .collect();

        let mut queue: VecDeque<NodeIndex> = remaining
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(n, _)| *n)
            .collect();

        while let Some(node) = queue.pop_front() {
            remaining.remove(&node);
            for dependent in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if let Some(deg) = remaining.get_mut(&dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if remaining.is_empty() {
            return Ok(());
        }

        let mut tasks: Vec<TaskId> = remaining.keys().map(|n| self.graph[*n].id).collect();
        tasks.sort();
        Err(Error::Cycle { tasks })
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.index
            .get(id)
            .and_then(|&node| self.graph.node_weight(node))
    }

    pub(crate) fn get_mut(&mut self, id: &TaskId) -> Option<&mut TaskRecord> {
        match self.index.get(id) {
            Some(&node) => self.graph.node_weight_mut(node),
            None => None,
        }
    }

    /// Like [`get`](Self::get) but with a `TaskNotFound` error.
    pub fn task(&self, id: &TaskId) -> Result<&TaskRecord> {
        self.get(id).ok_or(Error::TaskNotFound(*id))
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut TaskRecord> {
        self.get_mut(id).ok_or(Error::TaskNotFound(*id))
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// All task ids in ascending order.
    pub fn task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.index.keys().copied().collect();
        ids.sort();
        ids
    }

    /// All task records in ascending id order.
    pub fn tasks(&self) -> Vec<&TaskRecord> {
        self.task_ids()
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// Direct dependencies of a task, ascending.
    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that directly depend on `id`, ascending.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| self.graph[n].id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Number of dependencies of `id` that have not completed yet.
    pub fn in_degree(&self, id: &TaskId) -> usize {
        self.in_degree.get(id).copied().unwrap_or(0)
    }

    pub fn state(&self, id: &TaskId) -> Option<TaskState> {
        self.get(id).map(|t| t.state)
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.graph
            .node_weights()
            .filter(|t| t.state == state)
            .count()
    }

    pub fn all_terminal(&self) -> bool {
        self.graph.node_weights().all(|t| t.is_terminal())
    }

    // ========== Readiness Operations ==========

    /// Tasks with no unsatisfied dependencies that are still `Pending`.
    ///
    /// They are moved to `Ready` and returned in ascending id order, ready to
    /// seed the pool's queue.
    pub fn ready_at_start(&mut self) -> Vec<TaskId> {
        let ready: Vec<TaskId> = self
            .task_ids()
            .into_iter()
            .filter(|id| {
                self.in_degree(id) == 0 && self.state(id) == Some(TaskState::Pending)
            })
            .collect();
        for id in &ready {
            if let Some(task) = self.get_mut(id) {
                task.state = TaskState::Ready;
            }
        }
        ready
    }

    /// Apply a lifecycle transition to one task.
    pub fn transition(&mut self, id: &TaskId, next: TaskState) -> Result<()> {
        self.task_mut(id)?.transition(next)
    }

    /// Record that `id` completed and unlock its dependents.
    ///
    /// Returns the dependents whose unsatisfied count dropped to zero, now
    /// `Ready`, in ascending id order.
    ///
    /// # Errors
    /// `TaskNotFound`, or `InvalidTransition` if the task is already terminal.
    pub fn mark_completed(&mut self, id: &TaskId) -> Result<Vec<TaskId>> {
        let task = self.task_mut(id)?;
        if task.is_terminal() {
            return Err(Error::InvalidTransition {
                task: *id,
                from: task.state,
                to: TaskState::Completed,
            });
        }
        task.state = TaskState::Completed;
        task.completed_at = Some(Utc::now());

        let mut newly_ready = Vec::new();
        for dependent in self.dependents(id) {
            let remaining = self.in_degree.entry(dependent).or_insert(0);
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                if let Some(task) = self.get_mut(&dependent) {
                    if task.state == TaskState::Pending {
                        task.state = TaskState::Ready;
                        newly_ready.push(dependent);
                    }
                }
            }
        }
        Ok(newly_ready)
    }

    /// Record that `id` failed and skip every transitive dependent.
    ///
    /// Returns the ids that moved to `Skipped` by this call, ascending.
    /// Dependents already terminal are left untouched.
    pub fn mark_failed(&mut self, id: &TaskId, reason: &str) -> Result<Vec<TaskId>> {
        let task = self.task_mut(id)?;
        if task.is_terminal() {
            return Err(Error::InvalidTransition {
                task: *id,
                from: task.state,
                to: TaskState::Failed,
            });
        }
        task.state = TaskState::Failed;
        task.error = Some(reason.to_string());
        task.completed_at = Some(Utc::now());

        let mut skipped = Vec::new();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<TaskId> = self.dependents(id).into();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) {
                continue;
            }
            if let Some(task) = self.get_mut(&next) {
                if !task.is_terminal() {
                    task.state = TaskState::Skipped;
                    task.error = Some(format!("dependency {} failed", id));
                    task.completed_at = Some(Utc::now());
                    skipped.push(next);
                }
            }
            queue.extend(self.dependents(&next));
        }
        skipped.sort();
        Ok(skipped)
    }

    /// Skip every task that has not started yet (cancellation).
    pub fn skip_remaining(&mut self, reason: &str) -> Vec<TaskId> {
        let waiting: Vec<TaskId> = self
            .task_ids()
            .into_iter()
            .filter(|id| {
                matches!(
                    self.state(id),
                    Some(TaskState::Pending) | Some(TaskState::Ready)
                )
            })
            .collect();
        for id in &waiting {
            if let Some(task) = self.get_mut(id) {
                task.state = TaskState::Skipped;
                task.error = Some(reason.to_string());
                task.completed_at = Some(Utc::now());
            }
        }
        waiting
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}
