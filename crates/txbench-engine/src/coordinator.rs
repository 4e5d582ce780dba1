//! Fan-out of work to child processes.
//!
//! Each child gets its task as JSON on stdin and must answer with one JSON
//! document on stdout before the process timeout. A child that crashes,
//! exits non-zero, prints garbage or overruns the timeout is reported as
//! failed; it never blocks the others. Timed-out children are killed.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use txbench_core::{BenchError, BenchResult, RunSummary};

/// Builds the command for one child process.
///
/// The coordinator configures stdio and kill-on-drop itself.
pub trait ProcessLauncher: Send + Sync {
    fn command(&self, index: usize) -> Command;
}

/// Launches the current executable with fixed arguments.
#[derive(Debug, Clone)]
pub struct SelfExecLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl SelfExecLauncher {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-executes this binary with `subcommand`.
    pub fn current(subcommand: &str) -> BenchResult<Self> {
        Ok(Self::new(std::env::current_exe()?, [subcommand]))
    }
}

impl ProcessLauncher for SelfExecLauncher {
    fn command(&self, _index: usize) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

/// What one child process delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome<R> {
    Completed { index: usize, result: R },
    Failed { index: usize, reason: String },
}

impl<R> ProcessOutcome<R> {
    pub fn index(&self) -> usize {
        match self {
            Self::Completed { index, .. } | Self::Failed { index, .. } => *index,
        }
    }
}

/// Runs one child per task and collects their results.
pub struct ProcessCoordinator {
    launcher: Arc<dyn ProcessLauncher>,
    timeout: Duration,
}

impl ProcessCoordinator {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, timeout: Duration) -> Self {
        Self { launcher, timeout }
    }

    /// Starts one child per task and waits for all of them.
    ///
    /// Outcomes are returned in task order.
    pub async fn run_all<T, R>(&self, tasks: &[T]) -> Vec<ProcessOutcome<R>>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        info!("Launching {} processes", tasks.len());
        let runs = tasks
            .iter()
            .enumerate()
            .map(|(index, task)| async move {
                match self.run_one(index, task).await {
                    Ok(result) => {
                        debug!("Process {} completed", index);
                        ProcessOutcome::Completed { index, result }
                    }
                    Err(err) => {
                        let reason = match err {
                            BenchError::Process { reason, .. } => reason,
                            other => other.to_string(),
                        };
                        warn!("Process {} failed: {}", index, reason);
                        ProcessOutcome::Failed { index, reason }
                    }
                }
            });
        join_all(runs).await
    }

    async fn run_one<T, R>(&self, index: usize, task: &T) -> BenchResult<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(task)?;

        let mut command = self.launcher.command(index);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| BenchError::process(index, format!("failed to start: {e}")))?;
        debug!("Process {} started with pid {:?}", index, child.id());

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BenchError::process(index, "stdin was not captured"))?;

        // Dropping this future on timeout drops the child, which kills it.
        let exchange = async move {
            if let Err(err) = stdin.write_all(&payload).await {
                debug!("Process {} did not take its task: {}", index, err);
            }
            drop(stdin);
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result
                .map_err(|e| BenchError::process(index, format!("failed to wait: {e}")))?,
            Err(_) => {
                return Err(BenchError::process(
                    index,
                    format!("no result within {:?}, killed", self.timeout),
                ))
            }
        };

        if !output.status.success() {
            return Err(BenchError::process(
                index,
                format!("exited abnormally ({})", output.status),
            ));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| BenchError::process(index, format!("unparsable result: {e}")))
    }
}

/// Merges the summaries that arrived and flags the processes that did not deliver one.
pub fn merge_run_outcomes(outcomes: Vec<ProcessOutcome<RunSummary>>) -> RunSummary {
    let mut summaries = Vec::with_capacity(outcomes.len());
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome {
            ProcessOutcome::Completed { result, .. } => summaries.push(result),
            ProcessOutcome::Failed { index, reason } => failures.push((index, reason)),
        }
    }

    let mut merged = RunSummary::merge(summaries);
    for (index, reason) in failures {
        merged.record_failed_process(index, reason);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use txbench_core::LatencySample;

    #[test]
    fn test_merge_flags_missing_processes() {
        let summary = RunSummary::from_samples(
            &[LatencySample::success(Duration::from_millis(3), 0)],
            Duration::from_secs(2),
        );
        let outcomes = vec![
            ProcessOutcome::Completed {
                index: 0,
                result: summary.clone(),
            },
            ProcessOutcome::Failed {
                index: 1,
                reason: "exited abnormally (signal: 9 (SIGKILL))".to_string(),
            },
            ProcessOutcome::Completed {
                index: 2,
                result: summary,
            },
        ];

        let merged = merge_run_outcomes(outcomes);

        assert_eq!(merged.processes, 2);
        assert_eq!(merged.total_successes, 2);
        assert_eq!(merged.failed_processes.len(), 1);
        assert_eq!(merged.failed_processes[0].index, 1);
        assert!(!merged.is_complete());
    }

    #[test]
    fn test_self_exec_launcher_appends_subcommand() {
        let launcher = SelfExecLauncher::new("/usr/bin/txbench", ["worker-process"]);
        let command = launcher.command(0);
        let std_command = command.as_std();
        assert_eq!(std_command.get_program(), "/usr/bin/txbench");
        assert_eq!(
            std_command.get_args().collect::<Vec<_>>(),
            vec![std::ffi::OsStr::new("worker-process")]
        );
    }
}
