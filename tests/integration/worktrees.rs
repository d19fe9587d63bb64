//! Pool runs against real git worktrees.

use std::sync::Arc;

use epic_executor::core::{TaskId, TaskState};
use epic_executor::workspace::IntegrationStrategy;

use crate::fixtures::{
    chain, config, diamond, graph, independent, run_pool, Script, Scripted, TestRepo,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_branch_strategy_keeps_tasks_isolated() {
    let repo = TestRepo::new();
    let manager = repo.manager("iso", IntegrationStrategy::Branch);
    let collab = Scripted::new(Script::default().writing_files());
    let mut graph = graph(independent(3));

    let outcome = run_pool(&mut graph, config(3), collab.clone(), Arc::new(manager.clone())).await;

    assert!(outcome.status.is_success(), "{}", outcome.status);
    for id in 1..=3u32 {
        let files = repo.files_on(&manager.branch_name(TaskId(id)));
        let own = format!("task-{:03}.txt", id);
        assert!(files.contains(&own), "{:?}", files);
        assert_eq!(
            files.iter().filter(|f| f.starts_with("task-")).count(),
            1,
            "task {} saw other tasks' work: {:?}",
            id,
            files
        );
        assert!(!manager.worktree_path(TaskId(id)).exists());
        assert!(graph.get(&TaskId(id)).unwrap().commit.is_some());
    }
    // Nothing was integrated and the main working tree is untouched
    assert_eq!(repo.files_on("epic/iso"), vec![".gitignore", "README.md"]);
    assert!(!repo.path.join("task-001.txt").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_merge_strategy_feeds_dependents() {
    let repo = TestRepo::new();
    let manager = repo.manager("diamond", IntegrationStrategy::Merge);
    let collab = Scripted::new(Script::default().writing_files());
    let mut graph = graph(diamond());

    let outcome = run_pool(&mut graph, config(2), collab.clone(), Arc::new(manager.clone())).await;

    assert!(outcome.status.is_success(), "{}", outcome.status);

    // 2 and 3 branched after 1 was merged, before either of them finished
    for id in [2, 3] {
        let seen = collab.seen_files(id);
        assert!(seen.contains(&"task-001.txt".to_string()), "{:?}", seen);
    }
    assert!(!collab.seen_files(2).contains(&"task-003.txt".to_string()));
    assert!(!collab.seen_files(3).contains(&"task-002.txt".to_string()));

    let seen = collab.seen_files(4);
    for name in ["task-001.txt", "task-002.txt", "task-003.txt"] {
        assert!(seen.contains(&name.to_string()), "task 4 missing {}", name);
    }

    let target = repo.files_on(manager.target_branch());
    for id in 1..=4 {
        assert!(target.contains(&format!("task-{:03}.txt", id)));
    }
    assert!(!repo.path.join("task-001.txt").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fast_forward_chain() {
    let repo = TestRepo::new();
    let manager = repo.manager("ff chain", IntegrationStrategy::FastForward);
    let collab = Scripted::new(Script::default().writing_files());
    let mut graph = graph(chain(3));

    let outcome = run_pool(&mut graph, config(2), collab, Arc::new(manager.clone())).await;

    assert!(outcome.status.is_success(), "{}", outcome.status);
    let target = repo.files_on("epic/ff-chain");
    assert!(target.contains(&"task-003.txt".to_string()));
    assert_eq!(
        graph.get(&TaskId(3)).unwrap().commit,
        Some(crate::fixtures::git(&repo.path, &["rev-parse", "epic/ff-chain"]))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fast_forward_divergence_fails_one_task() {
    let repo = TestRepo::new();
    let manager = repo.manager("ff split", IntegrationStrategy::FastForward);
    let collab = Scripted::new(Script::default().writing_files());
    let mut graph = graph(independent(2));

    let outcome = run_pool(&mut graph, config(2), collab, Arc::new(manager.clone())).await;

    assert_eq!(outcome.status.counts.completed, 1);
    assert_eq!(outcome.status.counts.failed, 1);
    let failure = &outcome.status.failures[0];
    assert!(failure.reason.contains("integration failed"), "{}", failure.reason);
    assert!(failure.reason.contains("diverged"), "{}", failure.reason);
    let kept = failure.workspace.as_ref().expect("workspace preserved");
    assert!(kept.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_task_keeps_its_worktree() {
    let repo = TestRepo::new();
    let manager = repo.manager("broken", IntegrationStrategy::Merge);
    let collab = Scripted::new(Script::default().writing_files().fail(1));
    let mut graph = graph(chain(2));

    let outcome = run_pool(&mut graph, config(2), collab, Arc::new(manager.clone())).await;

    assert_eq!(outcome.status.state_of(TaskId(1)), Some(TaskState::Failed));
    assert_eq!(outcome.status.state_of(TaskId(2)), Some(TaskState::Skipped));

    let path = manager.worktree_path(TaskId(1));
    assert_eq!(outcome.status.failures[0].workspace.as_ref(), Some(&path));
    assert!(path.join("task-001.txt").exists());
    assert!(outcome
        .status
        .to_string()
        .contains(&format!("workspace kept at {}", path.display())));

    // The skipped dependent never got a worktree or branch
    assert!(!manager.worktree_path(TaskId(2)).exists());
    assert!(!repo.branch_exists(&manager.branch_name(TaskId(2))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rerun_reuses_preserved_worktree() {
    let repo = TestRepo::new();
    let manager = repo.manager("again", IntegrationStrategy::Branch);

    let failing = Scripted::new(Script::default().writing_files().fail(1));
    let mut first = graph(independent(1));
    let outcome = run_pool(&mut first, config(1), failing, Arc::new(manager.clone())).await;
    assert_eq!(outcome.status.counts.failed, 1);

    let passing = Scripted::new(Script::default().writing_files());
    let mut second = graph(independent(1));
    let outcome = run_pool(&mut second, config(1), passing.clone(), Arc::new(manager.clone())).await;

    assert!(outcome.status.is_success(), "{}", outcome.status);
    // The reused worktree still held the first attempt's file
    assert!(passing.seen_files(1).contains(&"task-001.txt".to_string()));
    assert!(!manager.worktree_path(TaskId(1)).exists());
}
