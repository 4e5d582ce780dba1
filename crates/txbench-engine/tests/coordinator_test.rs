//! Process isolation: children that crash, hang or misbehave are flagged
//! without holding back the others.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::process::Command;
use txbench_core::{LatencySample, RunSummary};
use txbench_engine::{merge_run_outcomes, ProcessCoordinator, ProcessLauncher, ProcessOutcome};

/// Runs `scripts[index]` with `sh -c` for child `index`.
struct ScriptLauncher {
    scripts: Vec<String>,
}

impl ScriptLauncher {
    fn new(scripts: impl IntoIterator<Item = impl Into<String>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts.into_iter().map(Into::into).collect(),
        })
    }
}

impl ProcessLauncher for ScriptLauncher {
    fn command(&self, index: usize) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(&self.scripts[index]);
        command
    }
}

fn summary(successes: usize) -> RunSummary {
    let samples = vec![LatencySample::success(Duration::from_millis(4), 0); successes];
    RunSummary::from_samples(&samples, Duration::from_secs(1))
}

/// A child that consumes its task and answers with `summary`.
fn answering(summary: &RunSummary) -> String {
    let json = serde_json::to_string(summary).unwrap();
    format!("cat > /dev/null; printf '%s' '{json}'")
}

#[tokio::test]
async fn test_killed_child_is_flagged_and_others_merged() {
    let launcher = ScriptLauncher::new([
        answering(&summary(3)),
        "cat > /dev/null; kill -9 $$".to_string(),
        answering(&summary(5)),
    ]);
    let coordinator = ProcessCoordinator::new(launcher, Duration::from_secs(30));

    let outcomes = coordinator.run_all::<usize, RunSummary>(&[0, 1, 2]).await;
    assert_eq!(
        outcomes.iter().map(ProcessOutcome::index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    let merged = merge_run_outcomes(outcomes);
    assert_eq!(merged.processes, 2);
    assert_eq!(merged.total_successes, 8);
    assert_eq!(merged.latency.count, 8);
    assert_eq!(merged.failed_processes.len(), 1);
    assert_eq!(merged.failed_processes[0].index, 1);
    assert!(merged.failed_processes[0].reason.contains("exited abnormally"));
}

#[tokio::test]
async fn test_hung_child_is_killed_at_timeout() {
    let launcher = ScriptLauncher::new([answering(&summary(2)), "sleep 30".to_string()]);
    let coordinator = ProcessCoordinator::new(launcher, Duration::from_millis(500));

    let started = Instant::now();
    let outcomes = coordinator.run_all::<usize, RunSummary>(&[0, 1]).await;
    assert!(started.elapsed() < Duration::from_secs(10));

    assert!(matches!(outcomes[0], ProcessOutcome::Completed { index: 0, .. }));
    match &outcomes[1] {
        ProcessOutcome::Failed { index, reason } => {
            assert_eq!(*index, 1);
            assert!(reason.contains("killed"), "{reason}");
        }
        other => panic!("expected a failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_garbage_output_and_bad_exit_status() {
    let launcher = ScriptLauncher::new([
        "cat > /dev/null; echo not-json",
        "cat > /dev/null; exit 3",
    ]);
    let coordinator = ProcessCoordinator::new(launcher, Duration::from_secs(30));

    let outcomes = coordinator.run_all::<usize, RunSummary>(&[0, 1]).await;

    match &outcomes[0] {
        ProcessOutcome::Failed { reason, .. } => assert!(reason.contains("unparsable result")),
        other => panic!("expected a failure, got {other:?}"),
    }
    match &outcomes[1] {
        ProcessOutcome::Failed { reason, .. } => assert!(reason.contains("exited abnormally")),
        other => panic!("expected a failure, got {other:?}"),
    }

    let merged = merge_run_outcomes(outcomes);
    assert_eq!(merged.processes, 0);
    assert_eq!(merged.failed_processes.len(), 2);
}

#[tokio::test]
async fn test_child_receives_its_task_on_stdin() {
    let launcher = ScriptLauncher::new(["cat", "cat"]);
    let coordinator = ProcessCoordinator::new(launcher, Duration::from_secs(30));
    let tasks = [json!({"index": 0, "shard": [0, 5]}), json!({"index": 1, "shard": [5, 10]})];

    let outcomes = coordinator.run_all::<Value, Value>(&tasks).await;

    for (outcome, task) in outcomes.into_iter().zip(tasks) {
        match outcome {
            ProcessOutcome::Completed { result, .. } => assert_eq!(result, task),
            other => panic!("expected a result, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_missing_program_is_a_failed_start() {
    struct Missing;
    impl ProcessLauncher for Missing {
        fn command(&self, _index: usize) -> Command {
            Command::new("/nonexistent/txbench-child")
        }
    }
    let coordinator = ProcessCoordinator::new(Arc::new(Missing), Duration::from_secs(5));

    let outcomes = coordinator.run_all::<usize, Value>(&[0]).await;

    match &outcomes[0] {
        ProcessOutcome::Failed { reason, .. } => assert!(reason.contains("failed to start")),
        other => panic!("expected a failure, got {other:?}"),
    }
}
