//! Runs the workers of one process concurrently on the current runtime.
//!
//! The binary drives each process with a current-thread runtime, so workers
//! interleave only where they await a database round trip or a backoff
//! sleep. Each worker owns its samples; the process summary is folded only
//! after every worker has returned.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};
use txbench_core::{
    BenchConfig, BenchError, BenchResult, BranchRange, Connector, RetryPolicy, RunSummary,
    ScaleModel, Statement, TableKind,
};

use crate::worker::{Worker, WorkerOptions, WorkerReport};

/// Reports of every worker of one process, ordered by worker id.
#[derive(Debug)]
pub struct ProcessReport {
    pub workers: Vec<WorkerReport>,
}

impl ProcessReport {
    /// Folds the worker reports into the process summary.
    ///
    /// Elapsed time spans from the earliest measured start to the latest
    /// finish of the workers that recorded samples.
    pub fn into_summary(self) -> RunSummary {
        let measured = || self.workers.iter().filter(|w| !w.samples.is_empty());
        let elapsed = match (
            measured().map(|w| w.started).min(),
            measured().map(|w| w.finished).max(),
        ) {
            (Some(started), Some(finished)) => finished.saturating_duration_since(started),
            _ => Duration::ZERO,
        };

        let fatal_errors = self
            .workers
            .iter()
            .filter_map(|w| w.fatal.as_ref().map(|err| format!("worker {}: {}", w.worker_id, err)))
            .collect();

        RunSummary::from_samples(self.workers.iter().flat_map(|w| &w.samples), elapsed)
            .with_fatal_errors(fatal_errors)
    }
}

/// Spawns and joins the workers of one process.
pub struct Scheduler {
    connector: Arc<dyn Connector>,
    config: BenchConfig,
    process_index: usize,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: BenchConfig,
        process_index: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connector,
            config,
            process_index,
            shutdown,
        }
    }

    /// Branch range of every worker.
    fn worker_branches(&self, workers: usize) -> BenchResult<Vec<BranchRange>> {
        let scale = ScaleModel::new(self.config.workload.scale)?;
        if !self.config.workload.partition_branches {
            return Ok(vec![scale.branches(); workers]);
        }
        if workers as i64 > scale.branch_count() {
            return Err(BenchError::invalid_config(format!(
                "cannot partition {} branches across {} workers",
                scale.branch_count(),
                workers
            )));
        }
        BranchRange::partition(scale.scale(), workers)
    }

    /// Per-worker seed: unique per (process, worker) so runs are reproducible.
    fn worker_seed(&self, worker_id: usize) -> Option<u64> {
        self.config.workload.seed.map(|seed| {
            seed.wrapping_add(((self.process_index as u64) << 32) | worker_id as u64)
        })
    }

    /// Runs `workers` workers of `transactions` transactions each.
    ///
    /// A failing worker never cancels its siblings; a panicking one is
    /// reported as a fatal worker error.
    pub async fn run(&self, workers: usize, transactions: u64) -> BenchResult<ProcessReport> {
        if workers == 0 {
            return Err(BenchError::invalid_config("workers must be > 0"));
        }
        let branches = self.worker_branches(workers)?;
        let retry = RetryPolicy::new(self.config.retry.clone());

        info!(
            "Process {} starting {} workers x {} transactions against {}",
            self.process_index,
            workers,
            transactions,
            self.connector.describe()
        );

        let mut handles = Vec::with_capacity(workers);
        for (worker_id, range) in branches.into_iter().enumerate() {
            let options = WorkerOptions {
                branches: range,
                preheat: self.config.workload.preheat,
                attempt_timeout: self.config.timeouts.attempt_timeout(),
                retry: retry.clone(),
                seed: self.worker_seed(worker_id),
            };
            let worker = Worker::new(
                worker_id,
                Arc::clone(&self.connector),
                options,
                self.shutdown.clone(),
            );
            handles.push(tokio::spawn(worker.run(transactions)));
        }

        let mut reports = Vec::with_capacity(workers);
        for (worker_id, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(join_err) => {
                    error!("Worker {} task failed: {}", worker_id, join_err);
                    reports.push(WorkerReport::aborted(
                        worker_id,
                        format!("worker task failed: {join_err}"),
                    ));
                }
            }
        }

        info!("Process {} finished: all workers joined", self.process_index);
        Ok(ProcessReport { workers: reports })
    }
}

/// Checks that the database holds at least `scale` branches.
pub async fn validate_scale(connector: &dyn Connector, scale: i64) -> BenchResult<i64> {
    let mut session = connector.connect().await?;
    let count = session
        .execute(&Statement::CountRows(TableKind::Branches))
        .await?
        .count()?;
    if let Err(err) = session.close().await {
        tracing::debug!("Failed to close validation session: {}", err);
    }

    if scale > count {
        return Err(BenchError::invalid_config(format!(
            "scale {scale} exceeds the number of initialized branches ({count}); \
             run 'init' with scale >= {scale} or reduce the scale"
        )));
    }
    info!("Scale validation passed: {} <= {} branches", scale, count);
    Ok(count)
}
