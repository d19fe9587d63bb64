//! Pool ordering, concurrency and failure propagation.

use epic_executor::core::{TaskId, TaskRecord, TaskState};
use epic_executor::orchestration::{PoolEvent, RetryMode};
use tempfile::TempDir;

use crate::fixtures::{
    chain, config, graph, independent, retrying, run_pool, scenario, shared, Call, Script,
    Scripted,
};

#[tokio::test(start_paused = true)]
async fn test_scenario_all_complete_with_two_slots() {
    let dir = TempDir::new().unwrap();
    let collab = Scripted::new(Script::default().delay(1, 50).delay(2, 80).delay(3, 10));
    let mut graph = graph(scenario());

    let outcome = run_pool(&mut graph, config(2), collab.clone(), shared(dir.path())).await;

    assert!(outcome.status.finished);
    assert!(outcome.status.is_success());
    assert_eq!(outcome.status.counts.completed, 4);

    // 1 and 2 overlap
    assert!(collab.position(Call::ImplementStart(TaskId(2))) < collab.position(Call::VerifyEnd(TaskId(1))));
    assert_eq!(collab.max_active(), 2);

    // 3 waits for both, 4 waits for 3
    let start3 = collab.position(Call::ImplementStart(TaskId(3)));
    assert!(collab.position(Call::VerifyEnd(TaskId(1))) < start3);
    assert!(collab.position(Call::VerifyEnd(TaskId(2))) < start3);
    assert!(collab.position(Call::VerifyEnd(TaskId(3))) < collab.position(Call::ImplementStart(TaskId(4))));

    assert!(outcome.completed_index(3).unwrap() < outcome.started_index(4).unwrap());
    assert!(matches!(
        outcome.events.last(),
        Some(PoolEvent::Finished { success: true })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_scenario_with_failing_task_two() {
    let dir = TempDir::new().unwrap();
    let collab = Scripted::new(Script::default().fail(2));
    let mut graph = graph(scenario());

    let outcome = run_pool(&mut graph, config(2), collab.clone(), shared(dir.path())).await;

    let status = &outcome.status;
    assert!(status.is_terminal());
    assert!(!status.is_success());
    assert_eq!(status.state_of(TaskId(1)), Some(TaskState::Completed));
    assert_eq!(status.state_of(TaskId(2)), Some(TaskState::Failed));
    assert_eq!(status.state_of(TaskId(3)), Some(TaskState::Skipped));
    assert_eq!(status.state_of(TaskId(4)), Some(TaskState::Skipped));
    assert!(!collab.was_started(3));
    assert!(!collab.was_started(4));
    assert_eq!(collab.verify_count(2), 0);

    let failure = &status.failures[0];
    assert_eq!(failure.task, TaskId(2));
    assert!(failure.reason.contains("task 002 exploded"));
    assert!(failure.workspace.is_none());

    assert!(matches!(
        outcome.events.last(),
        Some(PoolEvent::Finished { success: false })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_bound_is_never_exceeded() {
    for bound in 1..=4 {
        let dir = TempDir::new().unwrap();
        let mut script = Script::default();
        for id in 1..=10 {
            script = script.delay(id, 5 + (id as u64 * 7) % 20);
        }
        let collab = Scripted::new(script);
        let mut graph = graph(independent(10));

        let outcome = run_pool(&mut graph, config(bound), collab.clone(), shared(dir.path())).await;

        assert!(outcome.status.is_success());
        assert_eq!(collab.max_active(), bound, "bound {}", bound);
        assert!(outcome.max_active_status <= bound);
    }
}

#[tokio::test(start_paused = true)]
async fn test_dependent_waits_for_slow_dependency() {
    let dir = TempDir::new().unwrap();
    // 1 is slow; 2 depends on 1; 3 is unrelated and finishes long before 1
    let records = vec![
        TaskRecord::new(1, "slow"),
        TaskRecord::new(2, "after slow").depends_on(&[1]),
        TaskRecord::new(3, "quick"),
    ];
    let collab = Scripted::new(Script::default().delay(1, 500).delay(3, 5));
    let mut graph = graph(records);

    let outcome = run_pool(&mut graph, config(3), collab.clone(), shared(dir.path())).await;

    assert!(outcome.status.is_success());
    // Free slots were available the whole time; 2 still waited for 1
    assert!(collab.position(Call::VerifyEnd(TaskId(3))) < collab.position(Call::ImplementEnd(TaskId(1))));
    assert!(collab.position(Call::VerifyEnd(TaskId(1))) < collab.position(Call::ImplementStart(TaskId(2))));
    assert!(outcome.completed_index(1).unwrap() < outcome.started_index(2).unwrap());
    let ready2 = outcome
        .event_index(|e| matches!(e, PoolEvent::TaskReady { task } if *task == TaskId(2)))
        .unwrap();
    assert!(outcome.completed_index(1).unwrap() < ready2);
}

#[tokio::test(start_paused = true)]
async fn test_failure_only_skips_its_subtree() {
    let dir = TempDir::new().unwrap();
    // A=1 fails; B=2 depends on A; C=3 depends on B; D=4 is unrelated
    let records = vec![
        TaskRecord::new(1, "A"),
        TaskRecord::new(2, "B").depends_on(&[1]),
        TaskRecord::new(3, "C").depends_on(&[2]),
        TaskRecord::new(4, "D"),
    ];
    let collab = Scripted::new(Script::default().fail(1).delay(4, 100));
    let mut graph = graph(records);

    let outcome = run_pool(&mut graph, config(2), collab.clone(), shared(dir.path())).await;

    assert_eq!(outcome.status.state_of(TaskId(1)), Some(TaskState::Failed));
    assert_eq!(outcome.status.state_of(TaskId(2)), Some(TaskState::Skipped));
    assert_eq!(outcome.status.state_of(TaskId(3)), Some(TaskState::Skipped));
    assert_eq!(outcome.status.state_of(TaskId(4)), Some(TaskState::Completed));
    assert_eq!(outcome.status.skipped_ids(), vec![TaskId(2), TaskId(3)]);
    assert!(!collab.was_started(2));
    assert!(!collab.was_started(3));
    assert!(outcome.started_index(2).is_none());

    let skip_reasons: Vec<&str> = outcome
        .events
        .iter()
        .filter_map(|e| match e {
            PoolEvent::TaskSkipped { reason, .. } => Some(reason.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(skip_reasons, vec!["dependency 001 failed"; 2]);
    assert_eq!(
        graph.get(&TaskId(3)).unwrap().error.as_deref(),
        Some("dependency 001 failed")
    );
}

#[tokio::test(start_paused = true)]
async fn test_single_slot_runs_chain_in_order() {
    let dir = TempDir::new().unwrap();
    let collab = Scripted::new(Script::default());
    let mut graph = graph(chain(5));

    let outcome = run_pool(&mut graph, config(1), collab.clone(), shared(dir.path())).await;

    assert!(outcome.status.is_success());
    let starts: Vec<TaskId> = collab
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::ImplementStart(id) => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(starts, (1..=5).map(TaskId).collect::<Vec<_>>());
    assert_eq!(collab.max_active(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_full_retry_reimplements() {
    let dir = TempDir::new().unwrap();
    let collab = Scripted::new(Script::default().flaky(1, 2));
    let mut graph = graph(independent(1));

    let outcome = run_pool(
        &mut graph,
        retrying(1, 2, RetryMode::Full),
        collab.clone(),
        shared(dir.path()),
    )
    .await;

    assert!(outcome.status.is_success());
    assert_eq!(collab.implement_count(1), 3);
    assert_eq!(collab.verify_count(1), 3);
    assert_eq!(graph.get(&TaskId(1)).unwrap().attempts, 3);
    let retries = outcome
        .events
        .iter()
        .filter(|e| matches!(e, PoolEvent::TaskRetrying { .. }))
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test(start_paused = true)]
async fn test_verify_only_retry_keeps_implementation() {
    let dir = TempDir::new().unwrap();
    let collab = Scripted::new(Script::default().flaky(1, 1));
    let mut graph = graph(independent(1));

    let outcome = run_pool(
        &mut graph,
        retrying(1, 1, RetryMode::VerifyOnly),
        collab.clone(),
        shared(dir.path()),
    )
    .await;

    assert!(outcome.status.is_success());
    assert_eq!(collab.implement_count(1), 1);
    assert_eq!(collab.verify_count(1), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_fails_task() {
    let dir = TempDir::new().unwrap();
    let collab = Scripted::new(Script::default().flaky(1, 5));
    let mut graph = graph(chain(2));

    let outcome = run_pool(
        &mut graph,
        retrying(1, 1, RetryMode::Full),
        collab.clone(),
        shared(dir.path()),
    )
    .await;

    assert_eq!(outcome.status.failed_ids(), vec![TaskId(1)]);
    assert_eq!(outcome.status.skipped_ids(), vec![TaskId(2)]);
    assert_eq!(collab.verify_count(1), 2);
    assert!(outcome.status.failures[0]
        .reason
        .starts_with("verification failed"));
}

#[tokio::test(start_paused = true)]
async fn test_zero_retries_fails_fast() {
    let dir = TempDir::new().unwrap();
    let collab = Scripted::new(Script::default().flaky(1, 1));
    let mut graph = graph(independent(1));

    let outcome = run_pool(&mut graph, config(1), collab.clone(), shared(dir.path())).await;

    assert_eq!(outcome.status.failed_ids(), vec![TaskId(1)]);
    assert_eq!(collab.implement_count(1), 1);
    assert_eq!(collab.verify_count(1), 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_graph_finishes_immediately() {
    let dir = TempDir::new().unwrap();
    let collab = Scripted::new(Script::default());
    let mut graph = graph(vec![]);

    let outcome = run_pool(&mut graph, config(2), collab.clone(), shared(dir.path())).await;

    assert!(outcome.status.is_success());
    assert_eq!(outcome.events, vec![PoolEvent::Finished { success: true }]);
}
