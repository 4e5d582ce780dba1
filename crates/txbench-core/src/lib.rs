//! Core domain types and traits for the txbench workload generator.

pub mod config;
pub mod error;
pub mod retry;
pub mod sample;
pub mod schema;
pub mod statement;
pub mod stats;
pub mod traits;

pub use config::{BenchConfig, ConnectionConfig, RetryConfig, TimeoutConfig, WorkloadConfig};
pub use error::{BenchError, BenchResult, ErrorClass};
pub use retry::RetryPolicy;
pub use sample::{FailureKind, LatencySample};
pub use schema::{
    BranchRange, ScaleModel, ACCOUNTS_PER_BRANCH, DELTA_MAX, DELTA_MIN, INITIAL_BALANCE,
    TELLERS_PER_BRANCH,
};
pub use statement::{HistoryRow, Statement, StatementOutput, TableKind};
pub use stats::{LatencyDistribution, ProcessFailure, RunSummary};
pub use traits::{Connector, Session};
