//! Rendering of the final run summary.

use std::fmt::{self, Write};
use std::time::Duration;

use clap::ValueEnum;
use txbench_core::RunSummary;

/// Report format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Text,
    Json,
}

/// Renders `summary` in `format`.
pub fn render(summary: &RunSummary, format: ReportFormat) -> anyhow::Result<String> {
    match format {
        ReportFormat::Text => Ok(render_text(summary)?),
        ReportFormat::Json => Ok(serde_json::to_string_pretty(summary)?),
    }
}

fn ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Human-readable report.
pub fn render_text(summary: &RunSummary) -> Result<String, fmt::Error> {
    let mut out = String::new();
    write_text(&mut out, summary)?;
    Ok(out)
}

fn write_text(out: &mut impl Write, summary: &RunSummary) -> fmt::Result {
    let latency = &summary.latency;

    writeln!(out, "Run summary ({} processes)", summary.processes)?;
    writeln!(out, "  Attempts:        {}", summary.total_attempts)?;
    writeln!(out, "  Successes:       {}", summary.total_successes)?;
    writeln!(
        out,
        "  Failures:        {} ({:.2}%)",
        summary.total_failures,
        summary.error_rate() * 100.0
    )?;
    for (kind, count) in &summary.failures_by_kind {
        writeln!(out, "    {:<14} {}", format!("{kind}:"), count)?;
    }
    writeln!(out, "  Retries:         {}", summary.total_retries)?;
    writeln!(out, "  Elapsed:         {:.3}s", summary.elapsed.as_secs_f64())?;
    writeln!(out, "  Throughput:      {:.2} tps", summary.throughput())?;
    writeln!(out, "Latency (successful transactions, ms)")?;
    writeln!(out, "  Mean:            {:.3}", ms(latency.mean()))?;
    writeln!(out, "  Min:             {:.3}", ms(latency.min()))?;
    writeln!(out, "  P50:             {:.3}", ms(latency.p50()))?;
    writeln!(out, "  P95:             {:.3}", ms(latency.p95()))?;
    writeln!(out, "  P99:             {:.3}", ms(latency.p99()))?;
    writeln!(out, "  Max:             {:.3}", ms(latency.max()))?;

    if !summary.fatal_errors.is_empty() {
        writeln!(out, "Fatal errors ({})", summary.fatal_errors.len())?;
        for error in &summary.fatal_errors {
            writeln!(out, "  - {error}")?;
        }
    }
    if !summary.failed_processes.is_empty() {
        writeln!(out, "Failed processes ({})", summary.failed_processes.len())?;
        for failure in &summary.failed_processes {
            writeln!(out, "  - process {}: {}", failure.index, failure.reason)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use txbench_core::{FailureKind, LatencySample};

    fn summary() -> RunSummary {
        let samples = [
            LatencySample::success(Duration::from_millis(2), 0),
            LatencySample::success(Duration::from_millis(4), 1),
            LatencySample::failure(Duration::from_millis(8), 3, FailureKind::Conflict),
        ];
        RunSummary::from_samples(&samples, Duration::from_secs(1))
    }

    #[test]
    fn test_text_report_lists_counts_and_latencies() {
        let text = render_text(&summary()).unwrap();

        assert!(text.contains("Attempts:        3"));
        assert!(text.contains("Successes:       2"));
        assert!(text.contains("Failures:        1 (33.33%)"));
        assert!(text.contains("conflict:"));
        assert!(text.contains("Retries:         4"));
        assert!(text.contains("Throughput:      2.00 tps"));
        assert!(text.contains("Mean:            3.000"));
        assert!(text.contains("Max:             4.000"));
        assert!(!text.contains("Fatal errors"));
        assert!(!text.contains("Failed processes"));
    }

    #[test]
    fn test_text_report_flags_incomplete_runs() {
        let mut summary = summary().with_fatal_errors(vec!["worker 3: connection reset".into()]);
        summary.record_failed_process(1, "exited abnormally (signal: 9)");

        let text = render_text(&summary).unwrap();

        assert!(text.contains("Fatal errors (1)"));
        assert!(text.contains("worker 3: connection reset"));
        assert!(text.contains("Failed processes (1)"));
        assert!(text.contains("process 1: exited abnormally"));
    }

    #[test]
    fn test_json_report_parses_back() {
        let json = render(&summary(), ReportFormat::Json).unwrap();
        let parsed: RunSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, summary());
    }
}
