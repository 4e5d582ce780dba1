//! Workload execution engine: initialization, the transaction loop, and the
//! two concurrency layers (workers within a process, processes within a run).

pub mod coordinator;
pub mod initializer;
pub mod process;
pub mod runner;
pub mod scheduler;
pub mod template;
pub mod worker;

pub use coordinator::{
    merge_run_outcomes, ProcessCoordinator, ProcessLauncher, ProcessOutcome, SelfExecLauncher,
};
pub use initializer::{InitReport, Initializer, ShardFailure, ShardReport, ACCOUNT_BATCH_SIZE};
pub use process::{read_message, write_message, RunTask, ShardTask};
pub use runner::{initialize_database, populate_shard, run_benchmark, run_process, run_task};
pub use scheduler::{validate_scale, ProcessReport, Scheduler};
pub use template::{TransactionOutcome, TransactionParams, TransactionTemplate};
pub use worker::{Worker, WorkerOptions, WorkerReport};
