//! One simulated client: a transaction loop on a single session.
//!
//! Per transaction the worker runs the template, bounded by the attempt
//! timeout. Conflicts and transient errors are retried with backoff until
//! the retry budget is spent; constraint and statement errors fail the
//! transaction at once. Either way the loop moves on. Connection and fatal
//! errors stop the worker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::watch;
use tracing::{debug, error, warn};
use txbench_core::{
    BenchError, BranchRange, Connector, ErrorClass, FailureKind, LatencySample, RetryPolicy,
    Session,
};

use crate::template::{TransactionParams, TransactionTemplate};

/// Per-worker settings derived from the resolved configuration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Branches this worker samples from.
    pub branches: BranchRange,
    /// Unmeasured warm-up transactions.
    pub preheat: u64,
    pub attempt_timeout: Duration,
    pub retry: RetryPolicy,
    /// RNG seed; entropy when absent.
    pub seed: Option<u64>,
}

/// Everything a worker produced.
#[derive(Debug)]
pub struct WorkerReport {
    pub worker_id: usize,
    /// One sample per measured transaction, in execution order.
    pub samples: Vec<LatencySample>,
    /// Error that terminated the worker.
    pub fatal: Option<String>,
    /// Start of the measured window (after preheat).
    pub started: Instant,
    pub finished: Instant,
}

impl WorkerReport {
    fn new(worker_id: usize) -> Self {
        let now = Instant::now();
        Self {
            worker_id,
            samples: Vec::new(),
            fatal: None,
            started: now,
            finished: now,
        }
    }

    /// Report of a worker whose task died without returning.
    pub fn aborted(worker_id: usize, reason: impl Into<String>) -> Self {
        Self {
            fatal: Some(reason.into()),
            ..Self::new(worker_id)
        }
    }
}

/// A benchmark client bound to one session.
pub struct Worker {
    id: usize,
    connector: Arc<dyn Connector>,
    options: WorkerOptions,
    rng: StdRng,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        id: usize,
        connector: Arc<dyn Connector>,
        options: WorkerOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            id,
            connector,
            options,
            rng,
            shutdown,
        }
    }

    fn cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Runs `transaction_count` measured transactions and reports their samples.
    pub async fn run(mut self, transaction_count: u64) -> WorkerReport {
        let mut report = WorkerReport::new(self.id);

        let mut session = match self.connector.connect().await {
            Ok(session) => session,
            Err(err) => {
                error!("Worker {} could not connect: {}", self.id, err);
                report.fatal = Some(err.to_string());
                return report;
            }
        };

        for _ in 0..self.options.preheat {
            if self.cancelled() {
                break;
            }
            if let Err(err) = self.transact(session.as_mut()).await {
                error!("Worker {} failed during preheat: {}", self.id, err);
                report.fatal = Some(err.to_string());
                report.started = Instant::now();
                report.finished = report.started;
                return report;
            }
        }

        report.started = Instant::now();
        report.samples.reserve(transaction_count.min(1 << 20) as usize);

        for _ in 0..transaction_count {
            if self.cancelled() {
                debug!(
                    "Worker {} stopping after {} transactions",
                    self.id,
                    report.samples.len()
                );
                break;
            }
            match self.transact(session.as_mut()).await {
                Ok(sample) => report.samples.push(sample),
                Err(err) => {
                    error!("Worker {} stopped: {}", self.id, err);
                    report.fatal = Some(err.to_string());
                    break;
                }
            }
        }

        report.finished = Instant::now();

        if report.fatal.is_none() {
            if let Err(err) = session.close().await {
                debug!("Worker {} failed to close its session: {}", self.id, err);
            }
        }

        report
    }

    /// Runs one transaction to its final outcome.
    ///
    /// Returns `Err` only for errors that must stop the worker.
    async fn transact(&mut self, session: &mut dyn Session) -> Result<LatencySample, BenchError> {
        let params = TransactionParams::sample(self.options.branches, &mut self.rng);
        let started = Instant::now();
        let mut retries = 0u32;

        loop {
            let attempt = tokio::time::timeout(
                self.options.attempt_timeout,
                TransactionTemplate::execute(session, &params),
            )
            .await;

            let err = match attempt {
                Ok(Ok(_)) => return Ok(LatencySample::success(started.elapsed(), retries)),
                Ok(Err(err)) => err,
                Err(_) => {
                    if let Err(rollback_err) = session.rollback().await {
                        debug!("Rollback after timeout failed: {}", rollback_err);
                    }
                    BenchError::Transient(format!(
                        "deadline exceeded after {:?}",
                        self.options.attempt_timeout
                    ))
                }
            };

            match err.class() {
                ErrorClass::Retryable if self.options.retry.should_retry(&err, retries) => {
                    let delay = self.options.retry.delay(retries, &mut self.rng);
                    debug!(
                        "Worker {} transaction failed (attempt {}/{}), retrying after {}ms: {}",
                        self.id,
                        retries + 1,
                        self.options.retry.max_retries() + 1,
                        delay.as_millis(),
                        err
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                ErrorClass::Retryable | ErrorClass::Rejected => {
                    let kind = FailureKind::from_error(&err).unwrap_or(FailureKind::Transient);
                    warn!(
                        "Worker {} transaction on branch {} failed after {} retries: {}",
                        self.id, params.bid, retries, err
                    );
                    return Ok(LatencySample::failure(started.elapsed(), retries, kind));
                }
                ErrorClass::Fatal => return Err(err),
            }
        }
    }
}
