//! Re-running an epic with tasks completed by an earlier run.

use std::fs;

use epic_executor::core::{DependencyGraph, TaskId, TaskState};
use epic_executor::orchestration::compute_plan;
use epic_executor::state::ExecutionRecord;
use epic_executor::EpicManifest;
use tempfile::TempDir;

use crate::fixtures::{config, graph, run_pool, scenario, shared, Call, Script, Scripted};

const MANIFEST: &str = r#"
epic = "resume-demo"

[[tasks]]
id = 1
name = "schema"

[[tasks]]
id = 2
name = "config"

[[tasks]]
id = 3
name = "service"
depends_on = [1, 2]

[[tasks]]
id = 4
name = "endpoint"
depends_on = [3]
"#;

#[tokio::test(start_paused = true)]
async fn test_completed_tasks_are_not_reimplemented() {
    let dir = TempDir::new().unwrap();
    let records: Vec<_> = scenario()
        .into_iter()
        .map(|t| if t.id.0 <= 2 { t.completed() } else { t })
        .collect();
    let mut graph = graph(records);

    assert_eq!(compute_plan(&graph).levels, vec![vec![TaskId(3)], vec![TaskId(4)]]);

    let collab = Scripted::new(Script::default());
    let outcome = run_pool(&mut graph, config(2), collab.clone(), shared(dir.path())).await;

    assert!(outcome.status.is_success());
    assert!(!collab.was_started(1));
    assert!(!collab.was_started(2));
    assert_eq!(collab.calls()[0], Call::ImplementStart(TaskId(3)));
    assert_eq!(outcome.status.counts.completed, 4);
}

#[tokio::test(start_paused = true)]
async fn test_resume_from_record_after_failure() {
    let dir = TempDir::new().unwrap();
    let manifest_path = dir.path().join("epic.toml");
    fs::write(&manifest_path, MANIFEST).unwrap();
    let record_path = EpicManifest::record_path(&manifest_path);

    // First run: task 2 fails, so 3 and 4 are skipped
    let manifest = EpicManifest::load(&manifest_path).unwrap();
    let mut record = ExecutionRecord::new(&manifest.epic, None);
    let mut first = manifest.into_graph(None).unwrap();
    let collab = Scripted::new(Script::default().fail(2));
    let outcome = run_pool(&mut first, config(2), collab, shared(dir.path())).await;
    assert!(!outcome.status.is_success());
    record.update_from_status(&outcome.status);
    record.save(&record_path).await.unwrap();

    // Second run resumes: only 1 is done
    let saved = ExecutionRecord::load(&record_path).unwrap().unwrap();
    assert_eq!(saved.completed_tasks().into_iter().collect::<Vec<_>>(), vec![TaskId(1)]);
    assert_eq!(saved.failed_tasks().into_iter().collect::<Vec<_>>(), vec![TaskId(2)]);

    let manifest = EpicManifest::load(&manifest_path).unwrap();
    let mut second = manifest.into_graph(Some(&saved)).unwrap();
    assert_eq!(second.state(&TaskId(1)), Some(TaskState::Completed));
    assert_eq!(second.state(&TaskId(3)), Some(TaskState::Pending));

    let collab = Scripted::new(Script::default());
    let outcome = run_pool(&mut second, config(2), collab.clone(), shared(dir.path())).await;

    assert!(outcome.status.is_success());
    assert!(!collab.was_started(1));
    assert_eq!(collab.implement_count(2), 1);
    assert_eq!(collab.implement_count(3), 1);
    assert_eq!(collab.implement_count(4), 1);
}

#[test]
fn test_resuming_a_finished_epic_has_nothing_to_do() {
    let records: Vec<_> = scenario().into_iter().map(|t| t.completed()).collect();
    let mut graph = DependencyGraph::build(records).unwrap();
    assert!(compute_plan(&graph).is_empty());
    assert!(graph.ready_at_start().is_empty());
    assert!(graph.all_terminal());
}
