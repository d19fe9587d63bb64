//! Concurrency-bounded execution pool.
//!
//! The `ExecutionPool` drives every task of a [`DependencyGraph`] through
//! implement → verify while never holding more than `max_concurrent` pool
//! slots. A single event loop owns the graph: admissions, workspace
//! handling and all readiness updates happen there, one at a time. Only the
//! collaborator calls run concurrently, as tasks in a `JoinSet`.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::collaborator::{Artifacts, Implementer, VerificationReport, Verifier};
use super::status::PoolStatus;
use crate::core::{DependencyGraph, TaskId, TaskRecord, TaskState};
use crate::workspace::{ReleaseOutcome, Workspace, WorkspaceProvider};
use crate::{elog, elog_debug, elog_error, elog_trace, elog_warn, Error, Result};

/// Reason recorded on tasks skipped by cancellation.
pub const CANCELLED: &str = "cancelled";

/// What a retry re-runs after a failed verification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// Implement again, then verify again.
    #[default]
    Full,
    /// Only verify again. Failed implementations are still re-implemented.
    VerifyOnly,
}

/// Bounded retries; `max_retries = 0` fails fast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub mode: RetryMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_concurrent: usize,
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Lifecycle events emitted while the pool runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    TaskReady {
        task: TaskId,
    },
    TaskStarted {
        task: TaskId,
        workspace: PathBuf,
    },
    TaskVerifying {
        task: TaskId,
        attempt: u32,
    },
    TaskRetrying {
        task: TaskId,
        attempt: u32,
        reason: String,
    },
    TaskCompleted {
        task: TaskId,
        commit: Option<String>,
    },
    TaskFailed {
        task: TaskId,
        reason: String,
        workspace: Option<PathBuf>,
    },
    TaskSkipped {
        task: TaskId,
        reason: String,
    },
    Finished {
        success: bool,
    },
}

impl std::fmt::Display for PoolEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolEvent::TaskReady { task } => write!(f, "task {} ready", task),
            PoolEvent::TaskStarted { task, workspace } => {
                write!(f, "task {} started in {}", task, workspace.display())
            }
            PoolEvent::TaskVerifying { task, attempt } => {
                write!(f, "task {} verifying (attempt {})", task, attempt)
            }
            PoolEvent::TaskRetrying {
                task,
                attempt,
                reason,
            } => write!(f, "task {} retrying (attempt {}): {}", task, attempt, reason),
            PoolEvent::TaskCompleted { task, commit } => match commit {
                Some(commit) => write!(f, "task {} completed [{:.8}]", task, commit),
                None => write!(f, "task {} completed", task),
            },
            PoolEvent::TaskFailed { task, reason, .. } => {
                write!(f, "task {} failed: {}", task, reason)
            }
            PoolEvent::TaskSkipped { task, reason } => {
                write!(f, "task {} skipped: {}", task, reason)
            }
            PoolEvent::Finished { success: true } => f.write_str("run finished successfully"),
            PoolEvent::Finished { success: false } => f.write_str("run finished with failures"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Implement,
    Verify,
}

enum PhaseOutcome {
    Implemented(Result<Artifacts>),
    Verified(Result<VerificationReport>),
}

struct PhaseResult {
    task: TaskId,
    outcome: PhaseOutcome,
}

/// A task holding a pool slot.
struct InFlight {
    workspace: Workspace,
    artifacts: Option<Artifacts>,
    _permit: OwnedSemaphorePermit,
}

/// Mutable state of one `run`, owned by the event loop.
struct RunState {
    queue: VecDeque<TaskId>,
    in_flight: HashMap<TaskId, InFlight>,
    phases: JoinSet<PhaseResult>,
    cancelled: bool,
}

/// Runs a dependency graph to completion.
///
/// # Example
///
/// ```ignore
/// let pool = ExecutionPool::new(config, implementer, verifier, workspaces)?;
/// let stop = pool.cancel_token();
/// let status = pool.run(&mut graph).await?;
/// assert!(status.finished);
/// ```
pub struct ExecutionPool {
    config: PoolConfig,
    implementer: Arc<dyn Implementer>,
    verifier: Arc<dyn Verifier>,
    workspaces: Arc<dyn WorkspaceProvider>,
    cancel: CancellationToken,
    events: Option<mpsc::UnboundedSender<PoolEvent>>,
    status_tx: watch::Sender<PoolStatus>,
}

impl ExecutionPool {
    /// # Errors
    /// `Validation` if `max_concurrent` is zero.
    pub fn new(
        config: PoolConfig,
        implementer: Arc<dyn Implementer>,
        verifier: Arc<dyn Verifier>,
        workspaces: Arc<dyn WorkspaceProvider>,
    ) -> Result<Self> {
        if config.max_concurrent == 0 {
            return Err(Error::Validation(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        let (status_tx, _) = watch::channel(PoolStatus::default());
        Ok(Self {
            config,
            implementer,
            verifier,
            workspaces,
            cancel: CancellationToken::new(),
            events: None,
            status_tx,
        })
    }

    /// Send lifecycle events to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<PoolEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Token that stops the run cooperatively when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Live status, refreshed after every state change.
    pub fn subscribe(&self) -> watch::Receiver<PoolStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> PoolStatus {
        self.status_tx.borrow().clone()
    }

    /// Drive every non-terminal task to a terminal state.
    ///
    /// Per-task failures are recorded on the tasks and in the returned
    /// status; they never abort the run. An `Err` means the pool's own
    /// bookkeeping broke (a collaborator task could not be joined).
    pub async fn run(&self, graph: &mut DependencyGraph) -> Result<PoolStatus> {
        let slots = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut run = RunState {
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            phases: JoinSet::new(),
            cancelled: false,
        };

        elog!(
            "Pool starting: {} tasks, max_concurrent={}, retries={} ({:?})",
            graph.len(),
            self.config.max_concurrent,
            self.config.retry.max_retries,
            self.config.retry.mode
        );

        for id in graph.ready_at_start() {
            self.emit(PoolEvent::TaskReady { task: id });
            run.queue.push_back(id);
        }
        self.publish(graph, false);

        loop {
            if !run.cancelled && self.cancel.is_cancelled() {
                self.cancel_waiting(graph, &mut run);
            }

            // acquire can be slow, so the token is polled between admissions
            while !run.queue.is_empty() {
                if !run.cancelled && self.cancel.is_cancelled() {
                    self.cancel_waiting(graph, &mut run);
                }
                if run.cancelled {
                    break;
                }
                let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
                    break;
                };
                if let Some(id) = run.queue.pop_front() {
                    self.admit(graph, &mut run, id, permit).await?;
                }
            }

            if run.phases.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !run.cancelled => {
                    self.cancel_waiting(graph, &mut run);
                }
                joined = run.phases.join_next() => {
                    match joined {
                        Some(Ok(result)) => self.handle(graph, &mut run, result).await?,
                        Some(Err(e)) => {
                            elog_error!("Collaborator task could not be joined: {}", e);
                            return Err(Error::TaskJoin(e.to_string()));
                        }
                        None => {}
                    }
                }
            }
        }

        let stranded = graph.skip_remaining("never became ready");
        for id in stranded {
            elog_warn!("Task {} never became ready", id);
            self.emit(PoolEvent::TaskSkipped {
                task: id,
                reason: "never became ready".to_string(),
            });
        }

        let status = PoolStatus::from_graph(graph, true);
        self.status_tx.send_replace(status.clone());
        self.emit(PoolEvent::Finished {
            success: status.is_success(),
        });
        elog!(
            "Pool finished: {} completed, {} failed, {} skipped",
            status.counts.completed,
            status.counts.failed,
            status.counts.skipped
        );
        Ok(status)
    }

    /// Bind a workspace and start the implementation phase.
    async fn admit(
        &self,
        graph: &mut DependencyGraph,
        run: &mut RunState,
        id: TaskId,
        permit: OwnedSemaphorePermit,
    ) -> Result<()> {
        let record = graph.task(&id)?.clone();
        let workspace = match self.workspaces.acquire(&record).await {
            Ok(ws) => ws,
            Err(e) => {
                elog_warn!("Task {}: workspace acquire failed: {}", id, e);
                drop(permit);
                self.fail_unbound(graph, id, &e.to_string())?;
                return Ok(());
            }
        };

        if self.cancel.is_cancelled() {
            elog_debug!("Task {}: cancelled while its workspace was acquired", id);
            if let Err(e) = self
                .workspaces
                .release(&record, &workspace, ReleaseOutcome::Failure)
                .await
            {
                elog_warn!("Task {}: releasing unused workspace: {}", id, e);
            }
            drop(permit);
            // Still Ready, so this skips it along with the rest of the queue
            self.cancel_waiting(graph, run);
            return Ok(());
        }

        graph.transition(&id, TaskState::Running)?;
        let record = {
            let task = graph
                .get_mut(&id)
                .ok_or(Error::TaskNotFound(id))?;
            task.attempts = 1;
            task.workspace = Some(workspace.path.clone());
            task.branch = workspace.branch.clone();
            task.clone()
        };
        elog_debug!(
            "Task {} running in {} (new={})",
            id,
            workspace.path.display(),
            workspace.is_new
        );
        self.emit(PoolEvent::TaskStarted {
            task: id,
            workspace: workspace.path.clone(),
        });

        self.spawn_phase(run, Phase::Implement, record, workspace.clone());
        run.in_flight.insert(
            id,
            InFlight {
                workspace,
                artifacts: None,
                _permit: permit,
            },
        );
        self.publish(graph, false);
        Ok(())
    }

    async fn handle(
        &self,
        graph: &mut DependencyGraph,
        run: &mut RunState,
        result: PhaseResult,
    ) -> Result<()> {
        let id = result.task;
        match result.outcome {
            PhaseOutcome::Implemented(Ok(artifacts)) => {
                elog_trace!("Task {} implemented: {} files", id, artifacts.files.len());
                if run.cancelled {
                    self.fail_task(graph, run, id, "cancelled after implementation")
                        .await?;
                    return Ok(());
                }
                graph.transition(&id, TaskState::Verifying)?;
                let attempt = graph.task(&id)?.attempts;
                self.emit(PoolEvent::TaskVerifying { task: id, attempt });
                let record = graph.task(&id)?.clone();
                let flight = run.in_flight.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
                flight.artifacts = Some(artifacts);
                let workspace = flight.workspace.clone();
                self.spawn_phase(run, Phase::Verify, record, workspace);
            }
            PhaseOutcome::Implemented(Err(e)) => {
                let reason = format!("implementation failed: {}", e);
                elog_warn!("Task {}: {}", id, reason);
                if self.can_retry(graph, run, id)? {
                    self.retry(graph, run, id, Phase::Implement, &reason)?;
                } else {
                    self.fail_task(graph, run, id, &reason).await?;
                }
            }
            PhaseOutcome::Verified(Ok(report)) if report.passed() => {
                self.complete_task(graph, run, id).await?;
            }
            PhaseOutcome::Verified(outcome) => {
                let reason = match outcome {
                    Ok(report) => report.failure_reason(),
                    Err(e) => format!("verification error: {}", e),
                };
                elog_warn!("Task {}: {}", id, reason);
                if self.can_retry(graph, run, id)? {
                    let phase = match self.config.retry.mode {
                        RetryMode::Full => Phase::Implement,
                        RetryMode::VerifyOnly => Phase::Verify,
                    };
                    self.retry(graph, run, id, phase, &reason)?;
                } else {
                    self.fail_task(graph, run, id, &reason).await?;
                }
            }
        }
        self.publish(graph, false);
        Ok(())
    }

    fn can_retry(&self, graph: &DependencyGraph, run: &RunState, id: TaskId) -> Result<bool> {
        let attempts = graph.task(&id)?.attempts;
        Ok(!run.cancelled && attempts <= self.config.retry.max_retries)
    }

    /// Re-run a phase in the same workspace.
    fn retry(
        &self,
        graph: &mut DependencyGraph,
        run: &mut RunState,
        id: TaskId,
        phase: Phase,
        reason: &str,
    ) -> Result<()> {
        if phase == Phase::Implement && graph.state(&id) == Some(TaskState::Verifying) {
            graph.transition(&id, TaskState::Running)?;
        }
        let record = {
            let task = graph.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
            task.attempts += 1;
            task.clone()
        };
        elog_debug!("Task {} retry attempt {} ({:?})", id, record.attempts, phase);
        self.emit(PoolEvent::TaskRetrying {
            task: id,
            attempt: record.attempts,
            reason: reason.to_string(),
        });
        let workspace = run
            .in_flight
            .get(&id)
            .map(|f| f.workspace.clone())
            .ok_or(Error::TaskNotFound(id))?;
        self.spawn_phase(run, phase, record, workspace);
        Ok(())
    }

    /// Verification passed: integrate, reclaim the workspace, unlock dependents.
    async fn complete_task(
        &self,
        graph: &mut DependencyGraph,
        run: &mut RunState,
        id: TaskId,
    ) -> Result<()> {
        let Some(flight) = run.in_flight.remove(&id) else {
            return Err(Error::TaskNotFound(id));
        };
        let record = graph.task(&id)?.clone();

        let report = match self
            .workspaces
            .release(&record, &flight.workspace, ReleaseOutcome::Success)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                let reason = format!("integration failed: {}", e);
                elog_warn!("Task {}: {}", id, reason);
                let preserved = flight
                    .workspace
                    .isolated
                    .then(|| flight.workspace.path.clone());
                self.record_failure(graph, id, &reason, preserved)?;
                return Ok(());
            }
        };

        if let Some(task) = graph.get_mut(&id) {
            task.commit = report.integrated.clone().or(report.commit.clone());
            task.workspace = report.preserved.clone();
        }
        let newly_ready = graph.mark_completed(&id)?;
        elog!("Task {} completed", id);
        self.emit(PoolEvent::TaskCompleted {
            task: id,
            commit: report.commit,
        });
        for next in newly_ready {
            elog_debug!("Task {} ready", next);
            self.emit(PoolEvent::TaskReady { task: next });
            run.queue.push_back(next);
        }
        Ok(())
    }

    /// Fail an in-flight task: keep its workspace and skip its dependents.
    async fn fail_task(
        &self,
        graph: &mut DependencyGraph,
        run: &mut RunState,
        id: TaskId,
        reason: &str,
    ) -> Result<()> {
        let Some(flight) = run.in_flight.remove(&id) else {
            return Err(Error::TaskNotFound(id));
        };
        let record = graph.task(&id)?.clone();
        let fallback = flight
            .workspace
            .isolated
            .then(|| flight.workspace.path.clone());
        let preserved = match self
            .workspaces
            .release(&record, &flight.workspace, ReleaseOutcome::Failure)
            .await
        {
            Ok(report) => report.preserved.or(fallback),
            Err(e) => {
                elog_warn!("Task {}: releasing failed workspace: {}", id, e);
                fallback
            }
        };
        self.record_failure(graph, id, reason, preserved)
    }

    /// Fail a task that never got a workspace.
    fn fail_unbound(&self, graph: &mut DependencyGraph, id: TaskId, reason: &str) -> Result<()> {
        self.record_failure(graph, id, reason, None)?;
        self.publish(graph, false);
        Ok(())
    }

    fn record_failure(
        &self,
        graph: &mut DependencyGraph,
        id: TaskId,
        reason: &str,
        workspace: Option<PathBuf>,
    ) -> Result<()> {
        if let Some(task) = graph.get_mut(&id) {
            task.workspace = workspace.clone();
        }
        let skipped = graph.mark_failed(&id, reason)?;
        elog_warn!("Task {} failed: {}", id, reason);
        self.emit(PoolEvent::TaskFailed {
            task: id,
            reason: reason.to_string(),
            workspace,
        });
        for dependent in skipped {
            elog_debug!("Task {} skipped: dependency {} failed", dependent, id);
            self.emit(PoolEvent::TaskSkipped {
                task: dependent,
                reason: format!("dependency {} failed", id),
            });
        }
        Ok(())
    }

    /// Skip everything that has not started; in-flight tasks run on.
    fn cancel_waiting(&self, graph: &mut DependencyGraph, run: &mut RunState) {
        run.cancelled = true;
        run.queue.clear();
        let skipped = graph.skip_remaining(CANCELLED);
        elog!(
            "Cancellation requested: {} tasks skipped, {} still in flight",
            skipped.len(),
            run.in_flight.len()
        );
        for id in skipped {
            self.emit(PoolEvent::TaskSkipped {
                task: id,
                reason: CANCELLED.to_string(),
            });
        }
        self.publish(graph, false);
    }

    fn spawn_phase(&self, run: &mut RunState, phase: Phase, task: TaskRecord, workspace: Workspace) {
        let implementer = Arc::clone(&self.implementer);
        let verifier = Arc::clone(&self.verifier);
        run.phases.spawn(async move {
            let id = task.id;
            let outcome = match phase {
                Phase::Implement => {
                    let result = AssertUnwindSafe(implementer.implement(&task, &workspace))
                        .catch_unwind()
                        .await;
                    PhaseOutcome::Implemented(result.unwrap_or_else(|p| Err(panic_error(p))))
                }
                Phase::Verify => {
                    let result = AssertUnwindSafe(verifier.verify(&task, &workspace))
                        .catch_unwind()
                        .await;
                    PhaseOutcome::Verified(result.unwrap_or_else(|p| Err(panic_error(p))))
                }
            };
            PhaseResult { task: id, outcome }
        });
    }

    fn emit(&self, event: PoolEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn publish(&self, graph: &DependencyGraph, finished: bool) {
        self.status_tx
            .send_replace(PoolStatus::from_graph(graph, finished));
    }
}

fn panic_error(payload: Box<dyn Any + Send>) -> Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    Error::Collaborator(format!("collaborator panicked: {}", message))
}
