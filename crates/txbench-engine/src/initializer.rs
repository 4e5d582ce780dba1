//! Schema creation and bulk population.
//!
//! Tables are created once, then the branch space is split into shards that
//! are populated independently. Every branch is written as one transaction
//! for the branch and its tellers, followed by its accounts in batches of
//! [`ACCOUNT_BATCH_SIZE`] rows, each batch its own transaction. All writes
//! are upserts, so populating a shard twice converges to the same data.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use txbench_core::{
    BenchError, BenchResult, BranchRange, Connector, RetryPolicy, ScaleModel, Session, Statement,
    TELLERS_PER_BRANCH,
};

/// Accounts written per insert transaction.
pub const ACCOUNT_BATCH_SIZE: i64 = 10_000;

/// Rows written by one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardReport {
    pub shard: usize,
    pub branches: BranchRange,
    pub tellers: u64,
    pub accounts: u64,
    pub elapsed: Duration,
}

/// A shard that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardFailure {
    pub shard: usize,
    pub reason: String,
}

/// Completed and failed shards of one initialization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitReport {
    pub shards: Vec<ShardReport>,
    pub failures: Vec<ShardFailure>,
}

impl InitReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Fails with the first failed shard, if any.
    pub fn into_result(self) -> BenchResult<Vec<ShardReport>> {
        match self.failures.into_iter().next() {
            Some(failure) => Err(BenchError::initialization(
                failure.shard,
                BenchError::process(failure.shard, failure.reason),
            )),
            None => Ok(self.shards),
        }
    }

    pub(crate) fn record_failure(&mut self, shard: usize, err: BenchError) {
        let reason = match err {
            BenchError::Initialization { source, .. } => source.to_string(),
            other => other.to_string(),
        };
        self.failures.push(ShardFailure { shard, reason });
    }
}

/// Creates and populates the benchmark tables.
pub struct Initializer {
    connector: Arc<dyn Connector>,
    scale: ScaleModel,
    retry: RetryPolicy,
}

impl Initializer {
    pub fn new(connector: Arc<dyn Connector>, scale: ScaleModel, retry: RetryPolicy) -> Self {
        Self {
            connector,
            scale,
            retry,
        }
    }

    /// Shards for `processes` populating processes.
    pub fn shards(&self, processes: usize) -> BenchResult<Vec<BranchRange>> {
        BranchRange::partition(self.scale.scale(), processes)
    }

    /// Creates the tables if absent; drops existing ones first when `recreate` is set.
    pub async fn create_tables(&self, recreate: bool) -> BenchResult<()> {
        let mut session = self.connector.connect().await?;
        if recreate {
            info!("Dropping existing tables");
            session.execute(&Statement::DropTables).await?;
        }
        session.execute(&Statement::CreateTables).await?;
        close_quietly(session).await;
        info!("Tables ready on {}", self.connector.describe());
        Ok(())
    }

    /// Populates every branch of `range`.
    ///
    /// Stops at the first batch that fails; batches committed before it stay.
    pub async fn populate_shard(&self, shard: usize, range: BranchRange) -> BenchResult<ShardReport> {
        let started = Instant::now();
        let mut report = ShardReport {
            shard,
            branches: range,
            tellers: 0,
            accounts: 0,
            elapsed: Duration::ZERO,
        };

        if range.is_empty() {
            debug!("Shard {} is empty", shard);
            return Ok(report);
        }

        let mut session = self
            .connector
            .connect()
            .await
            .map_err(|err| BenchError::initialization(shard, err))?;

        for bid in range.iter() {
            if let Err(err) = self.populate_branch(session.as_mut(), bid, &mut report).await {
                error!("Shard {} failed on branch {}: {}", shard, bid, err);
                close_quietly(session).await;
                return Err(BenchError::initialization(shard, err));
            }
            debug!("Shard {} populated branch {}", shard, bid);
        }

        close_quietly(session).await;
        report.elapsed = started.elapsed();
        info!(
            "Shard {} {} done: {} branches, {} tellers, {} accounts in {:.1}s",
            shard,
            range,
            range.len(),
            report.tellers,
            report.accounts,
            report.elapsed.as_secs_f64()
        );
        Ok(report)
    }

    async fn populate_branch(
        &self,
        session: &mut dyn Session,
        bid: i64,
        report: &mut ShardReport,
    ) -> BenchResult<()> {
        self.commit_with_retries(
            session,
            &[
                Statement::UpsertBranch { bid },
                Statement::UpsertTellers { bid },
            ],
        )
        .await?;
        report.tellers += TELLERS_PER_BRANCH as u64;

        let accounts = ScaleModel::account_range(bid);
        let mut start = accounts.start;
        while start < accounts.end {
            let end = (start + ACCOUNT_BATCH_SIZE).min(accounts.end);
            self.commit_with_retries(session, &[Statement::UpsertAccounts { bid, aids: start..end }])
                .await?;
            report.accounts += (end - start) as u64;
            start = end;
        }
        Ok(())
    }

    /// Commits one batch, retrying conflicts and transient errors.
    async fn commit_with_retries(
        &self,
        session: &mut dyn Session,
        statements: &[Statement],
    ) -> BenchResult<()> {
        let mut retries = 0;
        loop {
            match session.execute_batch(statements).await {
                Ok(_) => return Ok(()),
                Err(err) if self.retry.should_retry(&err, retries) => {
                    let delay = self.retry.delay(retries, &mut rand::thread_rng());
                    warn!(
                        "Batch failed (attempt {}), retrying after {}ms: {}",
                        retries + 1,
                        delay.as_millis(),
                        err
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Creates the tables, then populates `processes` shards concurrently in this process.
    ///
    /// Every shard runs to completion; failed shards are listed next to the
    /// completed ones. Only a failure to create the tables is an error.
    pub async fn initialize(&self, processes: usize, recreate: bool) -> BenchResult<InitReport> {
        self.create_tables(recreate).await?;

        let shards = self.shards(processes)?;
        info!(
            "Populating {} branches in {} shards",
            self.scale.branch_count(),
            shards.len()
        );

        let results = join_all(
            shards
                .into_iter()
                .enumerate()
                .map(|(shard, range)| async move { (shard, self.populate_shard(shard, range).await) }),
        )
        .await;

        let mut report = InitReport::default();
        for (shard, result) in results {
            match result {
                Ok(shard_report) => report.shards.push(shard_report),
                Err(err) => report.record_failure(shard, err),
            }
        }
        Ok(report)
    }
}

async fn close_quietly(session: Box<dyn Session>) {
    if let Err(err) = session.close().await {
        debug!("Failed to close initializer session: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use txbench_core::{TableKind, ACCOUNTS_PER_BRANCH};
    use txbench_driver::{MemoryConfig, MemoryConnector, MemoryDatabase, MemoryFault};

    const PREFIX: &str = "pgbench";

    fn initializer(name: &str, scale: i64) -> (Arc<MemoryDatabase>, Initializer) {
        let database = MemoryDatabase::new(name, MemoryConfig::default());
        let connector = Arc::new(MemoryConnector::new(Arc::clone(&database), PREFIX));
        let init = Initializer::new(connector, ScaleModel::new(scale).unwrap(), RetryPolicy::no_retries());
        (database, init)
    }

    #[tokio::test]
    async fn test_initialize_populates_all_rows() {
        let (database, init) = initializer("init-all", 3);

        let report = init.initialize(2, false).await.unwrap();
        assert!(report.is_complete());
        let reports = report.shards;

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].branches, BranchRange::new(0, 2));
        assert_eq!(reports[1].branches, BranchRange::new(2, 3));
        assert_eq!(reports[0].accounts, 2 * ACCOUNTS_PER_BRANCH as u64);
        assert_eq!(database.row_count(PREFIX, TableKind::Branches), Some(3));
        assert_eq!(database.row_count(PREFIX, TableKind::Tellers), Some(30));
        assert_eq!(database.row_count(PREFIX, TableKind::Accounts), Some(300_000));
        assert_eq!(database.row_count(PREFIX, TableKind::History), Some(0));
    }

    #[tokio::test]
    async fn test_more_processes_than_branches() {
        let (database, init) = initializer("init-sparse", 1);

        let reports = init.initialize(3, false).await.unwrap().into_result().unwrap();

        assert_eq!(reports.len(), 3);
        assert!(reports[1].branches.is_empty());
        assert_eq!(reports[2].accounts, 0);
        assert_eq!(database.row_count(PREFIX, TableKind::Branches), Some(1));
    }

    #[tokio::test]
    async fn test_failed_batch_aborts_shard_and_keeps_earlier_batches() {
        let (database, init) = initializer("init-failure", 1);
        init.create_tables(false).await.unwrap();

        // Branch transaction: 2 statements + commit. Then three account
        // batches (statement + commit each), and the fourth batch fails.
        database.inject_faults(std::iter::repeat(MemoryFault::Ok).take(3 + 3 * 2));
        database.inject_faults([MemoryFault::Constraint("disk full")]);

        let err = init.populate_shard(4, BranchRange::new(0, 1)).await.unwrap_err();

        assert!(matches!(err, BenchError::Initialization { shard: 4, .. }));
        assert_eq!(database.row_count(PREFIX, TableKind::Branches), Some(1));
        assert_eq!(
            database.row_count(PREFIX, TableKind::Accounts),
            Some(3 * ACCOUNT_BATCH_SIZE)
        );
    }

    #[tokio::test]
    async fn test_failed_shard_is_listed_next_to_completed_ones() {
        let (database, init) = initializer("init-partial", 2);
        // Table creation goes through, the first shard statement is rejected
        database.inject_faults([MemoryFault::Ok, MemoryFault::Constraint("check violated")]);

        let report = init.initialize(2, false).await.unwrap();

        assert!(!report.is_complete());
        assert_eq!(report.shards.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_ne!(report.shards[0].shard, report.failures[0].shard);
        assert!(report.failures[0].reason.contains("check violated"));
        assert_eq!(database.row_count(PREFIX, TableKind::Branches), Some(1));

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, BenchError::Initialization { .. }));
    }

    #[tokio::test]
    async fn test_reinitialize_converges() {
        let (database, init) = initializer("init-twice", 1);
        init.initialize(1, false).await.unwrap();
        init.initialize(1, false).await.unwrap();

        assert_eq!(database.row_count(PREFIX, TableKind::Accounts), Some(ACCOUNTS_PER_BRANCH));
        assert_eq!(database.balance(PREFIX, TableKind::Branches, 0), Some(0));
    }

    #[tokio::test]
    async fn test_recreate_drops_previous_history() {
        let (database, init) = initializer("init-recreate", 1);
        init.initialize(1, false).await.unwrap();

        let connector = MemoryConnector::new(Arc::clone(&database), PREFIX);
        let mut session = connector.connect().await.unwrap();
        session
            .execute(&Statement::InsertHistory(txbench_core::HistoryRow {
                tid: 0,
                bid: 0,
                aid: 0,
                delta: 1,
                mtime: chrono::Utc::now(),
            }))
            .await
            .unwrap();
        assert_eq!(database.row_count(PREFIX, TableKind::History), Some(1));

        init.initialize(1, true).await.unwrap();
        assert_eq!(database.row_count(PREFIX, TableKind::History), Some(0));
    }

    #[tokio::test]
    async fn test_unavailable_database() {
        let (database, init) = initializer("init-refused", 2);
        init.create_tables(false).await.unwrap();
        database.refuse_connections(true);

        let err = init.populate_shard(0, BranchRange::new(0, 2)).await.unwrap_err();
        assert!(matches!(err, BenchError::Initialization { shard: 0, .. }));
    }
}
