//! Configuration management for txbench
//!
//! Values are resolved once, in the binary, with the precedence:
//! 1. Command-line flags (applied by the caller on top of [`BenchConfig::load`])
//! 2. Environment variables (`TXBENCH__SECTION__KEY`)
//! 3. Optional tuning file passed with `--config`
//! 4. Built-in defaults
//!
//! Components receive the resolved [`BenchConfig`] by value and never read
//! the environment themselves.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BenchError, BenchResult};

/// Default table prefix, shared with the classic pgbench layout.
pub const DEFAULT_PREFIX: &str = "pgbench";

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct BenchConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub workload: WorkloadConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl BenchConfig {
    /// Loads defaults, then the optional tuning file, then `TXBENCH__*` variables.
    ///
    /// The result is not validated yet: command-line flags are applied on
    /// top of it and [`BenchConfig::validate`] runs afterwards.
    pub fn load(file: Option<&Path>) -> BenchResult<Self> {
        let mut builder = Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }

        // Example: TXBENCH__RETRY__MAX_RETRIES=20
        builder = builder.add_source(
            Environment::with_prefix("TXBENCH")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: BenchConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validates configuration values.
    pub fn validate(&self) -> BenchResult<()> {
        self.connection.validate()?;
        self.workload.validate()?;
        self.retry.validate()?;
        self.timeouts.validate()
    }
}

/// Database target and credentials.
#[derive(Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// `memory://<name>` or `postgres://host:port[/database]`.
    pub endpoint: String,

    /// Database name, overrides the one in the endpoint URL.
    pub database: Option<String>,

    /// Root certificate used to verify the server.
    pub ca_file: Option<PathBuf>,

    pub user: Option<String>,

    pub password: Option<String>,

    /// Namespace holding the benchmark tables.
    pub prefix: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: None,
            ca_file: None,
            user: None,
            password: None,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("endpoint", &self.endpoint)
            .field("database", &self.database)
            .field("ca_file", &self.ca_file)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> BenchResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(BenchError::invalid_config(
                "connection.endpoint is required (--endpoint or TXBENCH_ENDPOINT)",
            ));
        }
        validate_prefix(&self.prefix)
    }
}

/// Rejects prefixes that could escape the quoted identifier they are rendered into.
pub fn validate_prefix(prefix: &str) -> BenchResult<()> {
    let valid = !prefix.is_empty()
        && prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '/'));
    if valid {
        Ok(())
    } else {
        Err(BenchError::invalid_config(format!(
            "invalid table prefix '{prefix}': only alphanumeric characters, underscores, hyphens and slashes are allowed"
        )))
    }
}

/// Shape of the generated load.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Number of branches.
    pub scale: i64,

    /// Concurrent workers per process.
    pub workers: usize,

    /// Measured transactions per worker.
    pub transactions: u64,

    /// Number of OS processes.
    pub processes: usize,

    /// Unmeasured warm-up transactions per worker.
    pub preheat: u64,

    /// Seed for deterministic sampling.
    pub seed: Option<u64>,

    /// Give every worker its own slice of the branch space.
    pub partition_branches: bool,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            scale: 100,
            workers: 7,
            transactions: 100,
            processes: 1,
            preheat: 0,
            seed: None,
            partition_branches: false,
        }
    }
}

impl WorkloadConfig {
    pub fn validate(&self) -> BenchResult<()> {
        if self.scale <= 0 {
            return Err(BenchError::invalid_config("workload.scale must be > 0"));
        }
        if self.workers == 0 {
            return Err(BenchError::invalid_config("workload.workers must be > 0"));
        }
        if self.processes == 0 {
            return Err(BenchError::invalid_config("workload.processes must be > 0"));
        }
        Ok(())
    }
}

/// Retry configuration for conflicting or transient transactions
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,

    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,

    /// Jitter as a fraction of the delay (0.0 - 1.0)
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_backoff_ms: 10,
            max_backoff_ms: 1000,
            backoff_multiplier: 2.0,
            jitter_percent: 0.5,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff delay (without jitter) before retry number `retry`, starting at 0
    pub fn backoff_for_retry(&self, retry: u32) -> Duration {
        let delay_ms = (self.initial_backoff_ms as f64
            * self.backoff_multiplier.powi(retry.min(i32::MAX as u32) as i32))
        .min(self.max_backoff_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }

    pub fn validate(&self) -> BenchResult<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(BenchError::invalid_config(
                "retry.backoff_multiplier must be >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_percent) {
            return Err(BenchError::invalid_config(
                "retry.jitter_percent must be within [0.0, 1.0]",
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(BenchError::invalid_config(
                "retry.max_backoff_ms must be >= initial_backoff_ms",
            ));
        }
        Ok(())
    }
}

/// Time limits for attempts, connections and child processes
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upper bound for one transaction attempt
    pub attempt_timeout_ms: u64,

    /// Upper bound for establishing a session
    pub connect_timeout_secs: u64,

    /// Upper bound for one child process, start to exit
    pub process_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 10_000,
            connect_timeout_secs: 30,
            process_timeout_secs: 3600,
        }
    }
}

impl TimeoutConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }

    pub fn validate(&self) -> BenchResult<()> {
        if self.attempt_timeout_ms == 0 {
            return Err(BenchError::invalid_config(
                "timeouts.attempt_timeout_ms must be > 0",
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(BenchError::invalid_config(
                "timeouts.connect_timeout_secs must be > 0",
            ));
        }
        if self.process_timeout_secs == 0 {
            return Err(BenchError::invalid_config(
                "timeouts.process_timeout_secs must be > 0",
            ));
        }
        Ok(())
    }
}
