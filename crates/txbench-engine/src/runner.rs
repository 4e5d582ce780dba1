//! Top-level `init` and `run` flows, for both the coordinating process and
//! its children.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use txbench_core::{
    BenchConfig, BenchResult, Connector, RetryPolicy, RunSummary, ScaleModel,
};
use txbench_driver::connector_for;

use crate::coordinator::{merge_run_outcomes, ProcessCoordinator, ProcessLauncher, ProcessOutcome};
use crate::initializer::{InitReport, Initializer, ShardFailure, ShardReport};
use crate::process::{RunTask, ShardTask};
use crate::scheduler::{validate_scale, Scheduler};

fn initializer(connector: Arc<dyn Connector>, config: &BenchConfig) -> BenchResult<Initializer> {
    Ok(Initializer::new(
        connector,
        ScaleModel::new(config.workload.scale)?,
        RetryPolicy::new(config.retry.clone()),
    ))
}

/// Creates and populates the tables with `config.workload.processes` shards.
///
/// One process (or an in-memory target) populates all shards concurrently
/// in-process; otherwise every shard gets its own child process. The report
/// lists completed shards next to the failed ones; only a failure to create
/// the tables is returned as an error.
pub async fn initialize_database(
    config: &BenchConfig,
    recreate: bool,
    launcher: Arc<dyn ProcessLauncher>,
) -> BenchResult<InitReport> {
    let connector = connector_for(&config.connection, &config.timeouts)?;
    let processes = config.workload.processes;
    let initializer = initializer(Arc::clone(&connector), config)?;

    if processes == 1 || connector.is_ephemeral() {
        return initializer.initialize(processes, recreate).await;
    }

    initializer.create_tables(recreate).await?;
    let tasks: Vec<ShardTask> = initializer
        .shards(processes)?
        .into_iter()
        .enumerate()
        .map(|(index, shard)| ShardTask {
            index,
            config: config.clone(),
            shard,
        })
        .collect();

    let outcomes: Vec<ProcessOutcome<ShardReport>> =
        ProcessCoordinator::new(launcher, config.timeouts.process_timeout())
            .run_all(&tasks)
            .await;
    Ok(collect_shard_outcomes(outcomes))
}

/// Sorts child outcomes into completed and failed shards.
fn collect_shard_outcomes(outcomes: Vec<ProcessOutcome<ShardReport>>) -> InitReport {
    let mut report = InitReport::default();
    for outcome in outcomes {
        match outcome {
            ProcessOutcome::Completed { result, .. } => report.shards.push(result),
            ProcessOutcome::Failed { index, reason } => {
                error!("Shard {} failed: {}", index, reason);
                report.failures.push(ShardFailure {
                    shard: index,
                    reason,
                });
            }
        }
    }
    report
}

/// Child side of `init`: populates one shard.
pub async fn populate_shard(task: ShardTask) -> BenchResult<ShardReport> {
    let connector = connector_for(&task.config.connection, &task.config.timeouts)?;
    initializer(connector, &task.config)?
        .populate_shard(task.index, task.shard)
        .await
}

/// Runs the workload of one process and folds its summary.
///
/// An in-memory target starts empty in every process, so it is populated
/// first unless this process already holds enough branches.
pub async fn run_process(
    config: &BenchConfig,
    index: usize,
    shutdown: watch::Receiver<bool>,
) -> BenchResult<RunSummary> {
    let connector = connector_for(&config.connection, &config.timeouts)?;

    if connector.is_ephemeral()
        && validate_scale(connector.as_ref(), config.workload.scale)
            .await
            .is_err()
    {
        info!("Provisioning in-memory database for process {}", index);
        initializer(Arc::clone(&connector), config)?
            .initialize(1, false)
            .await?
            .into_result()?;
    }

    let report = Scheduler::new(connector, config.clone(), index, shutdown)
        .run(config.workload.workers, config.workload.transactions)
        .await?;
    Ok(report.into_summary())
}

/// Child side of `run`.
pub async fn run_task(task: RunTask, shutdown: watch::Receiver<bool>) -> BenchResult<RunSummary> {
    run_process(&task.config, task.index, shutdown).await
}

/// Runs the benchmark across `config.workload.processes` processes.
///
/// The scale is validated against the database once, up front. With more
/// than one process the summaries of all children that delivered one are
/// merged; the others are flagged in the result.
pub async fn run_benchmark(
    config: &BenchConfig,
    launcher: Arc<dyn ProcessLauncher>,
    shutdown: watch::Receiver<bool>,
) -> BenchResult<RunSummary> {
    let connector = connector_for(&config.connection, &config.timeouts)?;
    if !connector.is_ephemeral() {
        validate_scale(connector.as_ref(), config.workload.scale).await?;
    }

    let processes = config.workload.processes;
    if processes == 1 {
        return run_process(config, 0, shutdown).await;
    }

    let tasks: Vec<RunTask> = (0..processes)
        .map(|index| RunTask {
            index,
            config: config.clone(),
        })
        .collect();
    let outcomes = ProcessCoordinator::new(launcher, config.timeouts.process_timeout())
        .run_all(&tasks)
        .await;

    let summary = merge_run_outcomes(outcomes);
    if !summary.failed_processes.is_empty() {
        warn!(
            "{} of {} processes delivered no summary",
            summary.failed_processes.len(),
            processes
        );
    }
    Ok(summary)
}
