//! Cooperative cancellation and misbehaving collaborators.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use epic_executor::core::{TaskId, TaskRecord, TaskState};
use epic_executor::orchestration::{ExecutionPool, CANCELLED};
use epic_executor::workspace::{
    ReleaseOutcome, ReleaseReport, SharedWorkspace, Workspace, WorkspaceProvider,
};
use epic_executor::Result;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::fixtures::{chain, config, graph, independent, run_pool, shared, Script, Scripted};

#[tokio::test(start_paused = true)]
async fn test_cancel_skips_waiting_and_stops_in_flight() {
    let dir = TempDir::new().unwrap();
    let collab = Scripted::new(Script::default().delay(1, 100));
    let mut graph = graph(chain(3));
    let pool = ExecutionPool::new(config(1), collab.clone(), collab.clone(), shared(dir.path()))
        .unwrap();

    let token = pool.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
    });

    let status = pool.run(&mut graph).await.unwrap();

    assert!(status.finished);
    assert!(status.is_terminal());
    // The in-flight implementation ran to completion but was not verified
    assert_eq!(collab.implement_count(1), 1);
    assert_eq!(collab.verify_count(1), 0);
    assert_eq!(status.state_of(TaskId(1)), Some(TaskState::Failed));
    assert_eq!(
        graph.get(&TaskId(1)).unwrap().error.as_deref(),
        Some("cancelled after implementation")
    );
    for id in [2, 3] {
        assert_eq!(status.state_of(TaskId(id)), Some(TaskState::Skipped));
        assert_eq!(graph.get(&TaskId(id)).unwrap().error.as_deref(), Some(CANCELLED));
        assert!(!collab.was_started(id));
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_run_starts_nothing() {
    let dir = TempDir::new().unwrap();
    let collab = Scripted::new(Script::default());
    let mut graph = graph(independent(3));
    let pool = ExecutionPool::new(config(2), collab.clone(), collab.clone(), shared(dir.path()))
        .unwrap();

    pool.cancel_token().cancel();
    let status = pool.run(&mut graph).await.unwrap();

    assert_eq!(status.counts.skipped, 3);
    assert!(!status.is_success());
    assert!((1..=3).all(|id| !collab.was_started(id)));
}

/// Cancels the run while handing out the workspace for one task.
struct CancellingWorkspace {
    inner: SharedWorkspace,
    cancel_on: TaskId,
    token: OnceLock<CancellationToken>,
    released: Mutex<Vec<(TaskId, ReleaseOutcome)>>,
}

#[async_trait]
impl WorkspaceProvider for CancellingWorkspace {
    async fn acquire(&self, task: &TaskRecord) -> Result<Workspace> {
        if task.id == self.cancel_on {
            if let Some(token) = self.token.get() {
                token.cancel();
            }
        }
        self.inner.acquire(task).await
    }

    async fn release(
        &self,
        task: &TaskRecord,
        workspace: &Workspace,
        outcome: ReleaseOutcome,
    ) -> Result<ReleaseReport> {
        self.released.lock().unwrap().push((task.id, outcome));
        self.inner.release(task, workspace, outcome).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_acquire_admits_nothing_more() {
    let dir = TempDir::new().unwrap();
    let collab = Scripted::new(Script::default().delay(1, 50));
    let workspaces = Arc::new(CancellingWorkspace {
        inner: SharedWorkspace::new(dir.path()),
        cancel_on: TaskId(2),
        token: OnceLock::new(),
        released: Mutex::new(Vec::new()),
    });
    let mut graph = graph(independent(3));
    let pool = ExecutionPool::new(config(3), collab.clone(), collab.clone(), workspaces.clone())
        .unwrap();
    workspaces.token.set(pool.cancel_token()).unwrap();

    let status = pool.run(&mut graph).await.unwrap();

    // Task 1 was admitted before the stop and ends as an in-flight cancel
    assert_eq!(status.state_of(TaskId(1)), Some(TaskState::Failed));
    assert_eq!(
        graph.get(&TaskId(1)).unwrap().error.as_deref(),
        Some("cancelled after implementation")
    );
    // Task 2 got its workspace after the stop; it and task 3 never start
    for id in [2, 3] {
        assert_eq!(status.state_of(TaskId(id)), Some(TaskState::Skipped));
        assert_eq!(graph.get(&TaskId(id)).unwrap().error.as_deref(), Some(CANCELLED));
        assert!(!collab.was_started(id));
    }
    let released = workspaces.released.lock().unwrap().clone();
    assert!(released.contains(&(TaskId(2), ReleaseOutcome::Failure)));
    assert!(!released.iter().any(|(id, _)| *id == TaskId(3)));
}

#[tokio::test(start_paused = true)]
async fn test_no_retry_after_cancel() {
    let dir = TempDir::new().unwrap();
    let collab = Scripted::new(Script::default().delay(1, 50).flaky(1, 3));
    let mut graph = graph(independent(1));
    let mut pool_config = config(1);
    pool_config.retry.max_retries = 5;
    let pool =
        ExecutionPool::new(pool_config, collab.clone(), collab.clone(), shared(dir.path())).unwrap();

    let token = pool.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        token.cancel();
    });

    let status = pool.run(&mut graph).await.unwrap();

    assert_eq!(status.state_of(TaskId(1)), Some(TaskState::Failed));
    // First attempt verified at t=50, retry implementation at t=50..100
    // ends after the cancel and is never verified
    assert_eq!(collab.implement_count(1), 2);
    assert_eq!(collab.verify_count(1), 1);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_implementer_fails_only_its_task() {
    let dir = TempDir::new().unwrap();
    let collab = Scripted::new(Script::default().panic(2));
    let mut graph = graph(independent(3));

    let outcome = run_pool(&mut graph, config(3), collab.clone(), shared(dir.path())).await;

    assert_eq!(outcome.status.failed_ids(), vec![TaskId(2)]);
    assert_eq!(outcome.status.counts.completed, 2);
    let reason = &outcome.status.failures[0].reason;
    assert!(reason.contains("collaborator panicked"), "{}", reason);
    assert!(reason.contains("implementer blew up on task 002"), "{}", reason);
}

#[test]
fn test_zero_concurrency_is_rejected() {
    let dir = TempDir::new().unwrap();
    let collab = Scripted::new(Script::default());
    let result = ExecutionPool::new(config(0), collab.clone(), collab, shared(dir.path()));
    assert!(result.is_err());
}
