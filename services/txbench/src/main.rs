use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use txbench_core::BenchConfig;
use txbench_engine::{
    initialize_database, populate_shard, read_message, run_benchmark, run_task, write_message,
    RunTask, SelfExecLauncher, ShardTask,
};

mod report;

use report::ReportFormat;

#[derive(Parser, Debug)]
#[command(name = "txbench")]
#[command(about = "TPC-B style transactional workload generator", long_about = None)]
#[command(version)]
struct Cli {
    /// Endpoint to connect to (postgres://host:port/db or memory://name)
    #[arg(short, long, env = "TXBENCH_ENDPOINT", global = true)]
    endpoint: Option<String>,

    /// Database to work with, overrides the one in the endpoint
    #[arg(short, long, env = "TXBENCH_DATABASE", global = true)]
    database: Option<String>,

    /// Root certificate file; enables TLS with full verification
    #[arg(long, env = "TXBENCH_CA_FILE", global = true)]
    ca_file: Option<PathBuf>,

    /// Username for authentication
    #[arg(long, env = "TXBENCH_USER", global = true)]
    user: Option<String>,

    /// Password for authentication
    #[arg(long, env = "TXBENCH_PASSWORD", global = true, hide_env_values = true)]
    password: Option<String>,

    /// Namespace holding the benchmark tables (default: pgbench)
    #[arg(long, env = "TXBENCH_PREFIX_PATH", global = true)]
    prefix_path: Option<String>,

    /// Number of branches (default: 100)
    #[arg(short, long, env = "TXBENCH_SCALE", global = true)]
    scale: Option<i64>,

    /// Tuning file (TOML, YAML or JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the tables and load the initial data
    Init {
        /// Number of parallel processes (default: 1)
        #[arg(long)]
        processes: Option<usize>,

        /// Drop existing tables first
        #[arg(long)]
        recreate: bool,
    },

    /// Run the transaction workload and print the report
    Run {
        /// Concurrent workers per process (default: 7)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Transactions each worker runs (default: 100)
        #[arg(short, long)]
        transactions: Option<u64>,

        /// Number of parallel processes (default: 1)
        #[arg(long)]
        processes: Option<usize>,

        /// Unmeasured warm-up transactions per worker
        #[arg(long)]
        preheat: Option<u64>,

        /// Seed for reproducible parameter sampling
        #[arg(long)]
        seed: Option<u64>,

        /// Give every worker its own slice of the branches
        #[arg(long)]
        partition_branches: bool,

        /// Report format
        #[arg(long, value_enum, default_value = "text")]
        format: ReportFormat,
    },

    /// Runs one process of `run` (task on stdin, summary on stdout)
    #[command(hide = true)]
    WorkerProcess,

    /// Populates one shard of `init` (task on stdin, report on stdout)
    #[command(hide = true)]
    InitShard,
}

fn main() -> Result<ExitCode> {
    init_logging();

    let cli = Cli::parse();

    // One thread per process; parallelism comes from processes.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;

    runtime.block_on(execute(cli))
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Init {
            processes,
            recreate,
        } => {
            let mut config = resolve_config(&cli)?;
            if let Some(processes) = processes {
                config.workload.processes = processes;
            }
            config.validate()?;

            info!(
                "Initializing {} with prefix={}, scale={}, processes={}",
                config.connection.endpoint,
                config.connection.prefix,
                config.workload.scale,
                config.workload.processes
            );

            let launcher = Arc::new(SelfExecLauncher::current("init-shard")?);
            let report = initialize_database(&config, recreate, launcher)
                .await
                .context("initialization failed")?;

            for shard in &report.shards {
                println!(
                    "Shard {} {}: {} branches, {} tellers, {} accounts in {:.1}s",
                    shard.shard,
                    shard.branches,
                    shard.branches.len(),
                    shard.tellers,
                    shard.accounts,
                    shard.elapsed.as_secs_f64()
                );
            }
            for failure in &report.failures {
                println!("Shard {} failed: {}", failure.shard, failure.reason);
            }

            if !report.is_complete() {
                error!(
                    "Initialization incomplete: {} of {} shards failed",
                    report.failures.len(),
                    report.failures.len() + report.shards.len()
                );
                return Ok(ExitCode::FAILURE);
            }
            println!("Initialization completed");
            Ok(ExitCode::SUCCESS)
        }

        Commands::Run {
            workers,
            transactions,
            processes,
            preheat,
            seed,
            partition_branches,
            format,
        } => {
            let mut config = resolve_config(&cli)?;
            let workload = &mut config.workload;
            if let Some(workers) = workers {
                workload.workers = workers;
            }
            if let Some(transactions) = transactions {
                workload.transactions = transactions;
            }
            if let Some(processes) = processes {
                workload.processes = processes;
            }
            if let Some(preheat) = preheat {
                workload.preheat = preheat;
            }
            if seed.is_some() {
                workload.seed = seed;
            }
            if partition_branches {
                workload.partition_branches = true;
            }
            config.validate()?;

            info!(
                "Running {} processes x {} workers x {} transactions against {}",
                config.workload.processes,
                config.workload.workers,
                config.workload.transactions,
                config.connection.endpoint
            );

            let launcher = Arc::new(SelfExecLauncher::current("worker-process")?);
            let summary = run_benchmark(&config, launcher, shutdown_on_ctrl_c()).await?;

            println!("{}", report::render(&summary, format)?);

            if summary.processes == 0 {
                error!("No process delivered a summary");
                return Ok(ExitCode::FAILURE);
            }
            if !summary.is_complete() {
                error!(
                    "Run incomplete: {} fatal worker errors, {} failed processes",
                    summary.fatal_errors.len(),
                    summary.failed_processes.len()
                );
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::WorkerProcess => {
            let task: RunTask = read_message(&mut tokio::io::stdin())
                .await
                .context("failed to read the run task")?;
            debug!("Process {} received its task", task.index);

            let summary = run_task(task, shutdown_on_ctrl_c()).await?;
            write_message(&mut tokio::io::stdout(), &summary).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::InitShard => {
            let task: ShardTask = read_message(&mut tokio::io::stdin())
                .await
                .context("failed to read the shard task")?;
            debug!("Shard {} received its task", task.index);

            let report = populate_shard(task).await?;
            write_message(&mut tokio::io::stdout(), &report).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Loads the layered configuration and applies the global flags on top.
fn resolve_config(cli: &Cli) -> Result<BenchConfig> {
    let mut config =
        BenchConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    let connection = &mut config.connection;
    if let Some(endpoint) = &cli.endpoint {
        connection.endpoint = endpoint.clone();
    }
    if let Some(database) = &cli.database {
        connection.database = Some(database.clone());
    }
    if let Some(ca_file) = &cli.ca_file {
        connection.ca_file = Some(ca_file.clone());
    }
    if let Some(user) = &cli.user {
        connection.user = Some(user.clone());
    }
    if let Some(password) = &cli.password {
        connection.password = Some(password.clone());
    }
    if let Some(prefix) = &cli.prefix_path {
        connection.prefix = prefix.clone();
    }
    if let Some(scale) = cli.scale {
        config.workload.scale = scale;
    }

    debug!("Resolved configuration: {:?}", config);
    Ok(config)
}

/// Flips the returned flag on the first Ctrl-C.
///
/// Workers finish their in-flight transaction and start no new ones, so a
/// summary is still produced. Children get the signal through the process
/// group and stop the same way.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after in-flight transactions");
            let _ = tx.send(true);
        }
    });
    rx
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags_parse() {
        let cli = Cli::try_parse_from([
            "txbench",
            "-e",
            "memory://flags",
            "-s",
            "4",
            "run",
            "-w",
            "3",
            "-t",
            "50",
            "--partition-branches",
            "--seed",
            "9",
        ])
        .unwrap();

        assert_eq!(cli.endpoint.as_deref(), Some("memory://flags"));
        assert_eq!(cli.scale, Some(4));
        match cli.command {
            Commands::Run {
                workers,
                transactions,
                partition_branches,
                seed,
                format,
                ..
            } => {
                assert_eq!(workers, Some(3));
                assert_eq!(transactions, Some(50));
                assert!(partition_branches);
                assert_eq!(seed, Some(9));
                assert_eq!(format, ReportFormat::Text);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "txbench",
            "init",
            "--processes",
            "2",
            "--prefix-path",
            "team/bench",
        ])
        .unwrap();

        assert_eq!(cli.prefix_path.as_deref(), Some("team/bench"));
        assert!(matches!(
            cli.command,
            Commands::Init {
                processes: Some(2),
                recreate: false
            }
        ));
    }

    #[test]
    fn test_hidden_child_commands_parse() {
        let cli = Cli::try_parse_from(["txbench", "worker-process"]).unwrap();
        assert!(matches!(cli.command, Commands::WorkerProcess));
        let cli = Cli::try_parse_from(["txbench", "init-shard"]).unwrap();
        assert!(matches!(cli.command, Commands::InitShard));
    }
}
