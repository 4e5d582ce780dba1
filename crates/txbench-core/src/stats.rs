//! Statistics aggregation
//!
//! Samples are folded into a [`RunSummary`] once every worker of a process
//! has finished; per-process summaries are merged once every process has
//! exited. Neither step shares mutable state with running workers.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sample::LatencySample;

/// Latency statistics over successful transactions, in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyDistribution {
    pub count: u64,
    pub mean_us: f64,
    pub min_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

impl LatencyDistribution {
    /// Computes the distribution of `latencies_us`; all zero when empty.
    pub fn from_latencies(latencies_us: &[u64]) -> Self {
        if latencies_us.is_empty() {
            return Self::default();
        }

        let mut sorted = latencies_us.to_vec();
        sorted.sort_unstable();

        let sum: u128 = sorted.iter().map(|&v| u128::from(v)).sum();
        Self {
            count: sorted.len() as u64,
            mean_us: sum as f64 / sorted.len() as f64,
            min_us: sorted[0],
            p50_us: percentile(&sorted, 0.50),
            p95_us: percentile(&sorted, 0.95),
            p99_us: percentile(&sorted, 0.99),
            max_us: sorted[sorted.len() - 1],
        }
    }

    pub fn mean(&self) -> Duration {
        Duration::from_secs_f64(self.mean_us / 1_000_000.0)
    }

    pub fn min(&self) -> Duration {
        Duration::from_micros(self.min_us)
    }

    pub fn p50(&self) -> Duration {
        Duration::from_micros(self.p50_us)
    }

    pub fn p95(&self) -> Duration {
        Duration::from_micros(self.p95_us)
    }

    pub fn p99(&self) -> Duration {
        Duration::from_micros(self.p99_us)
    }

    pub fn max(&self) -> Duration {
        Duration::from_micros(self.max_us)
    }
}

/// Value at quantile `p` of an ascending, non-empty slice.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    let index = ((sorted.len() as f64) * p) as usize;
    sorted[index.min(sorted.len() - 1)]
}

/// A child process that did not deliver a summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessFailure {
    pub index: usize,
    pub reason: String,
}

/// Aggregated outcome of a run (one process, or all of them merged).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Number of processes whose results are included.
    pub processes: usize,
    pub total_attempts: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_retries: u64,
    /// Wall-clock span of the measured window.
    pub elapsed: Duration,
    pub latency: LatencyDistribution,
    /// Failed transactions keyed by failure kind.
    pub failures_by_kind: BTreeMap<String, u64>,
    /// Raw latencies of successful transactions, kept for exact merging.
    pub latencies_us: Vec<u64>,
    /// Errors that terminated workers.
    pub fatal_errors: Vec<String>,
    pub failed_processes: Vec<ProcessFailure>,
}

impl RunSummary {
    /// Folds one process's samples.
    pub fn from_samples<'a, I>(samples: I, elapsed: Duration) -> Self
    where
        I: IntoIterator<Item = &'a LatencySample>,
    {
        let mut summary = Self {
            processes: 1,
            elapsed,
            ..Default::default()
        };

        for sample in samples {
            summary.total_attempts += 1;
            summary.total_retries += u64::from(sample.retry_count);
            if sample.succeeded {
                summary.total_successes += 1;
                summary
                    .latencies_us
                    .push(sample.duration.as_micros().min(u128::from(u64::MAX)) as u64);
            } else {
                summary.total_failures += 1;
                if let Some(kind) = sample.failure {
                    *summary
                        .failures_by_kind
                        .entry(kind.as_str().to_string())
                        .or_insert(0) += 1;
                }
            }
        }

        summary.latency = LatencyDistribution::from_latencies(&summary.latencies_us);
        summary
    }

    /// Attaches fatal worker errors.
    pub fn with_fatal_errors(mut self, errors: Vec<String>) -> Self {
        self.fatal_errors.extend(errors);
        self
    }

    /// Merges per-process summaries: counts add up, elapsed is the maximum
    /// and the latency distribution is recomputed over the union of samples.
    pub fn merge<I>(summaries: I) -> Self
    where
        I: IntoIterator<Item = RunSummary>,
    {
        let mut merged = Self::default();

        for summary in summaries {
            merged.processes += summary.processes;
            merged.total_attempts += summary.total_attempts;
            merged.total_successes += summary.total_successes;
            merged.total_failures += summary.total_failures;
            merged.total_retries += summary.total_retries;
            merged.elapsed = merged.elapsed.max(summary.elapsed);
            for (kind, count) in summary.failures_by_kind {
                *merged.failures_by_kind.entry(kind).or_insert(0) += count;
            }
            merged.latencies_us.extend(summary.latencies_us);
            merged.fatal_errors.extend(summary.fatal_errors);
            merged.failed_processes.extend(summary.failed_processes);
        }

        merged.latency = LatencyDistribution::from_latencies(&merged.latencies_us);
        merged
    }

    /// Records a process that produced no summary.
    pub fn record_failed_process(&mut self, index: usize, reason: impl Into<String>) {
        self.failed_processes.push(ProcessFailure {
            index,
            reason: reason.into(),
        });
    }

    /// Successful transactions per second of wall-clock time.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.total_successes as f64 / secs
    }

    /// Fraction of failed transactions (0.0-1.0).
    pub fn error_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            return 0.0;
        }
        self.total_failures as f64 / self.total_attempts as f64
    }

    /// True when no worker died and every process delivered its summary.
    pub fn is_complete(&self) -> bool {
        self.fatal_errors.is_empty() && self.failed_processes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::FailureKind;

    fn ok(ms: u64) -> LatencySample {
        LatencySample::success(Duration::from_millis(ms), 0)
    }

    fn failed(ms: u64) -> LatencySample {
        LatencySample::failure(Duration::from_millis(ms), 3, FailureKind::Conflict)
    }

    #[test]
    fn test_aggregates_three_workers() {
        let worker_a: Vec<_> = (0..5).map(ok).chain([failed(9)]).collect();
        let worker_b: Vec<_> = (0..10).map(ok).collect();
        let worker_c: Vec<_> = (0..2).map(ok).chain((0..3).map(failed)).collect();

        let summary = RunSummary::from_samples(
            worker_a.iter().chain(&worker_b).chain(&worker_c),
            Duration::from_secs(2),
        );

        assert_eq!(summary.total_attempts, 21);
        assert_eq!(summary.total_successes, 17);
        assert_eq!(summary.total_failures, 4);
        assert_eq!(summary.total_retries, 12);
        assert_eq!(summary.failures_by_kind.get("conflict"), Some(&4));
        assert_eq!(summary.latency.count, 17);
        assert_eq!(summary.throughput(), 8.5);
    }

    #[test]
    fn test_distribution_ignores_failures() {
        let samples = vec![
            ok(10),
            ok(20),
            LatencySample::failure(Duration::from_secs(60), 0, FailureKind::Constraint),
        ];
        let summary = RunSummary::from_samples(&samples, Duration::from_secs(1));

        assert_eq!(summary.latency.max(), Duration::from_millis(20));
        assert_eq!(summary.latency.min_us, 10_000);
        assert_eq!(summary.latency.mean_us, 15_000.0);
    }

    #[test]
    fn test_percentiles() {
        // 100 samples: 0us, 100us, 200us, ..., 9900us
        let latencies: Vec<u64> = (0..100).map(|i| i * 100).collect();
        let distribution = LatencyDistribution::from_latencies(&latencies);

        assert_eq!(distribution.p50(), Duration::from_micros(5000));
        assert_eq!(distribution.p95(), Duration::from_micros(9500));
        assert_eq!(distribution.p99(), Duration::from_micros(9900));
        assert_eq!(distribution.max(), Duration::from_micros(9900));
    }

    #[test]
    fn test_empty_distribution() {
        let distribution = LatencyDistribution::from_latencies(&[]);
        assert_eq!(distribution, LatencyDistribution::default());

        let summary = RunSummary::from_samples(std::iter::empty(), Duration::ZERO);
        assert_eq!(summary.throughput(), 0.0);
        assert_eq!(summary.error_rate(), 0.0);
    }

    #[test]
    fn test_merge_processes() {
        let first = RunSummary::from_samples(&[ok(1), ok(3), failed(5)], Duration::from_secs(4));
        let second = RunSummary::from_samples(&[ok(2), ok(4)], Duration::from_secs(6))
            .with_fatal_errors(vec!["worker 1: connection reset".to_string()]);

        let merged = RunSummary::merge(vec![first, second]);

        assert_eq!(merged.processes, 2);
        assert_eq!(merged.total_attempts, 5);
        assert_eq!(merged.total_successes, 4);
        assert_eq!(merged.total_failures, 1);
        assert_eq!(merged.elapsed, Duration::from_secs(6));
        assert_eq!(merged.latency.count, 4);
        assert_eq!(merged.latency.min_us, 1000);
        assert_eq!(merged.latency.max_us, 4000);
        assert_eq!(merged.latency.p50_us, 3000);
        assert_eq!(merged.fatal_errors.len(), 1);
        assert!(!merged.is_complete());
    }

    #[test]
    fn test_summary_survives_json_roundtrip() {
        let mut summary = RunSummary::from_samples(&[ok(7), failed(1)], Duration::from_millis(1500));
        summary.record_failed_process(2, "killed by signal 9");

        let json = serde_json::to_string(&summary).unwrap();
        let decoded: RunSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, summary);
    }
}
