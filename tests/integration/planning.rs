//! Level plans and graph validation over generated graphs.

use std::collections::HashSet;

use epic_executor::core::{DependencyGraph, TaskId, TaskRecord};
use epic_executor::orchestration::compute_plan;
use epic_executor::Error;

use crate::fixtures::{chain, diamond, graph, scenario};

/// Small deterministic generator so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

/// Random DAG: every edge points from a lower id to a higher one.
fn random_dag(rng: &mut Lcg, size: u32) -> Vec<TaskRecord> {
    (1..=size)
        .map(|id| {
            let mut deps = Vec::new();
            for candidate in 1..id {
                if rng.below(4) == 0 {
                    deps.push(candidate);
                }
            }
            TaskRecord::new(id, &format!("t{}", id)).depends_on(&deps)
        })
        .collect()
}

fn assert_plan_is_valid(graph: &DependencyGraph) {
    let plan = compute_plan(graph);
    let mut seen = HashSet::new();
    for (level, ids) in plan.levels.iter().enumerate() {
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(&sorted, ids, "level {} not ascending", level);
        for id in ids {
            assert!(seen.insert(*id), "task {} appears twice", id);
            for dep in graph.dependencies(id) {
                let dep_level = plan.level_of(&dep).expect("dependency planned");
                assert!(dep_level < level, "{} -> {} not ordered", dep, id);
            }
        }
    }
    assert_eq!(seen.len(), graph.len());
}

#[test]
fn test_generated_dags_have_valid_plans() {
    let mut rng = Lcg(7);
    for round in 0..200 {
        let size = 1 + (round % 25) as u32;
        let records = random_dag(&mut rng, size);
        assert_plan_is_valid(&graph(records));
    }
}

#[test]
fn test_shuffled_input_gives_same_plan() {
    let mut records = diamond();
    let forward = compute_plan(&graph(records.clone()));
    records.reverse();
    assert_eq!(compute_plan(&graph(records)), forward);
}

#[test]
fn test_known_shapes() {
    let plan = compute_plan(&graph(chain(4)));
    assert_eq!(plan.level_count(), 4);
    assert_eq!(plan.max_parallelism(), 1);

    let plan = compute_plan(&graph(scenario()));
    assert_eq!(
        plan.levels,
        vec![vec![TaskId(1), TaskId(2)], vec![TaskId(3)], vec![TaskId(4)]]
    );
    assert_eq!(plan.to_string(), "Level 0: 001, 002\nLevel 1: 003\nLevel 2: 004\n");
}

#[test]
fn test_cycles_of_every_length_are_rejected() {
    for len in 1..=30u32 {
        // Ring 1 -> 2 -> ... -> len -> 1, plus an unrelated root
        let mut records: Vec<TaskRecord> = (1..=len)
            .map(|id| {
                let dep = if id == 1 { len } else { id - 1 };
                TaskRecord::new(id, "ring").depends_on(&[dep])
            })
            .collect();
        records.push(TaskRecord::new(100, "root"));

        match DependencyGraph::build(records) {
            Err(Error::Cycle { tasks }) => {
                let expected: Vec<TaskId> = (1..=len).map(TaskId).collect();
                assert_eq!(tasks, expected, "ring of {}", len);
            }
            other => panic!("ring of {} built: {:?}", len, other.map(|g| g.len())),
        }
    }
}

#[test]
fn test_cycle_hidden_in_generated_dag() {
    let mut rng = Lcg(42);
    for size in 3..20u32 {
        let mut records = random_dag(&mut rng, size);
        // Close a loop from the first task back to the last one
        records[0].depends_on.push(TaskId(size));
        records[size as usize - 1].depends_on.push(TaskId(1));
        let err = DependencyGraph::build(records).unwrap_err();
        assert!(matches!(err, Error::Cycle { .. }), "size {}", size);
        assert!(err.is_structural());
    }
}

#[test]
fn test_unknown_dependency_is_structural() {
    let records = vec![
        TaskRecord::new(1, "a"),
        TaskRecord::new(2, "b").depends_on(&[1, 9]),
    ];
    let err = DependencyGraph::build(records).unwrap_err();
    assert!(matches!(
        err,
        Error::UnknownDependency {
            task: TaskId(2),
            dependency: TaskId(9)
        }
    ));
}

#[test]
fn test_file_conflicts_within_a_level() {
    let records = vec![
        TaskRecord::new(1, "a").with_files(&["src/lib.rs", "src/a.rs"]),
        TaskRecord::new(2, "b").with_files(&["src/lib.rs"]),
        TaskRecord::new(3, "c").depends_on(&[1]).with_files(&["src/a.rs"]),
    ];
    let graph = graph(records);
    let conflicts = compute_plan(&graph).file_conflicts(&graph);
    assert_eq!(conflicts.len(), 1);
    assert_eq!((conflicts[0].first, conflicts[0].second), (TaskId(1), TaskId(2)));
}
