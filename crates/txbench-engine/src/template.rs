//! The fixed TPC-B transaction.

use chrono::Utc;
use rand::Rng;
use txbench_core::{
    BenchError, BenchResult, BranchRange, HistoryRow, ScaleModel, Session, Statement, TableKind,
    DELTA_MAX, DELTA_MIN,
};

/// Randomly sampled inputs of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionParams {
    pub bid: i64,
    pub tid: i64,
    pub aid: i64,
    pub delta: i64,
}

impl TransactionParams {
    /// Samples a branch from `branches`, then a teller and an account owned by it.
    ///
    /// `branches` must not be empty.
    pub fn sample<R: Rng + ?Sized>(branches: BranchRange, rng: &mut R) -> Self {
        let bid = rng.gen_range(branches.iter());
        Self {
            bid,
            tid: rng.gen_range(ScaleModel::teller_range(bid)),
            aid: rng.gen_range(ScaleModel::account_range(bid)),
            delta: rng.gen_range(DELTA_MIN..=DELTA_MAX),
        }
    }
}

/// Committed result of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOutcome {
    pub bid: i64,
    pub tid: i64,
    pub aid: i64,
    pub delta: i64,
    /// Account balance after the commit.
    pub balance: i64,
}

/// Read-update-insert-commit sequence.
pub struct TransactionTemplate;

impl TransactionTemplate {
    /// Statements of one transaction, in execution order.
    pub fn statements(params: &TransactionParams) -> Vec<Statement> {
        vec![
            Statement::ReadBalance {
                table: TableKind::Accounts,
                id: params.aid,
            },
            Statement::AddBalance {
                table: TableKind::Accounts,
                id: params.aid,
                delta: params.delta,
            },
            Statement::AddBalance {
                table: TableKind::Tellers,
                id: params.tid,
                delta: params.delta,
            },
            Statement::AddBalance {
                table: TableKind::Branches,
                id: params.bid,
                delta: params.delta,
            },
            Statement::InsertHistory(HistoryRow {
                tid: params.tid,
                bid: params.bid,
                aid: params.aid,
                delta: params.delta,
                mtime: Utc::now(),
            }),
        ]
    }

    /// Runs the transaction atomically on `session`.
    ///
    /// On failure the transaction is rolled back and the original error is returned.
    pub async fn execute(
        session: &mut dyn Session,
        params: &TransactionParams,
    ) -> BenchResult<TransactionOutcome> {
        let outputs = session.execute_batch(&Self::statements(params)).await?;
        let balance = outputs
            .first()
            .copied()
            .ok_or_else(|| BenchError::Statement("account read returned nothing".to_string()))?
            .balance()?;

        Ok(TransactionOutcome {
            bid: params.bid,
            tid: params.tid,
            aid: params.aid,
            delta: params.delta,
            balance: balance + params.delta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;
    use txbench_core::Connector;
    use txbench_driver::{MemoryConfig, MemoryConnector, MemoryDatabase, MemoryFault};

    const PREFIX: &str = "pgbench";

    async fn one_branch(name: &str) -> (Arc<MemoryDatabase>, MemoryConnector) {
        let database = MemoryDatabase::new(name, MemoryConfig::default());
        let connector = MemoryConnector::new(Arc::clone(&database), PREFIX);
        let mut session = connector.connect().await.unwrap();
        session
            .execute_batch(&[
                Statement::CreateTables,
                Statement::UpsertBranch { bid: 0 },
                Statement::UpsertTellers { bid: 0 },
                Statement::UpsertAccounts {
                    bid: 0,
                    aids: ScaleModel::account_range(0),
                },
            ])
            .await
            .unwrap();
        (database, connector)
    }

    #[test]
    fn test_sampled_ids_belong_to_the_branch() {
        let mut rng = StdRng::seed_from_u64(42);
        let branches = BranchRange::new(3, 7);

        for _ in 0..1000 {
            let params = TransactionParams::sample(branches, &mut rng);
            assert!(branches.contains(params.bid));
            assert_eq!(ScaleModel::branch_of_teller(params.tid), params.bid);
            assert_eq!(ScaleModel::branch_of_account(params.aid), params.bid);
            assert!((DELTA_MIN..=DELTA_MAX).contains(&params.delta));
        }
    }

    #[test]
    fn test_seeded_sampling_is_deterministic() {
        let branches = BranchRange::new(0, 100);
        let mut first = StdRng::seed_from_u64(9);
        let mut second = StdRng::seed_from_u64(9);
        for _ in 0..10 {
            assert_eq!(
                TransactionParams::sample(branches, &mut first),
                TransactionParams::sample(branches, &mut second)
            );
        }
    }

    #[tokio::test]
    async fn test_execute_returns_committed_balance() {
        let (database, connector) = one_branch("template-commit").await;
        let mut session = connector.connect().await.unwrap();
        let params = TransactionParams {
            bid: 0,
            tid: 4,
            aid: 1234,
            delta: -17,
        };

        let first = TransactionTemplate::execute(session.as_mut(), &params).await.unwrap();
        let second = TransactionTemplate::execute(session.as_mut(), &params).await.unwrap();

        assert_eq!(first.balance, -17);
        assert_eq!(second.balance, -34);
        assert_eq!(database.balance(PREFIX, TableKind::Tellers, 4), Some(-34));
        assert_eq!(database.balance(PREFIX, TableKind::Branches, 0), Some(-34));
        assert_eq!(database.row_count(PREFIX, TableKind::History), Some(2));
    }

    #[tokio::test]
    async fn test_forced_conflict_leaves_balances_unchanged() {
        let (database, connector) = one_branch("template-conflict").await;
        let mut session = connector.connect().await.unwrap();
        let params = TransactionParams {
            bid: 0,
            tid: 2,
            aid: 99,
            delta: 500,
        };
        let before = [
            database.balance(PREFIX, TableKind::Accounts, 99),
            database.balance(PREFIX, TableKind::Tellers, 2),
            database.balance(PREFIX, TableKind::Branches, 0),
        ];

        // Account and teller updates succeed, the branch update conflicts
        database.inject_faults([
            MemoryFault::Ok,
            MemoryFault::Ok,
            MemoryFault::Ok,
            MemoryFault::Conflict("concurrent update"),
        ]);
        let err = TransactionTemplate::execute(session.as_mut(), &params)
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::Conflict(_)));

        let after = [
            database.balance(PREFIX, TableKind::Accounts, 99),
            database.balance(PREFIX, TableKind::Tellers, 2),
            database.balance(PREFIX, TableKind::Branches, 0),
        ];
        assert_eq!(before, after);
        assert_eq!(database.row_count(PREFIX, TableKind::History), Some(0));

        // The session is usable afterwards
        TransactionTemplate::execute(session.as_mut(), &params).await.unwrap();
        assert_eq!(database.balance(PREFIX, TableKind::Accounts, 99), Some(500));
    }
}
