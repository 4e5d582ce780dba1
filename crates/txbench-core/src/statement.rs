//! Typed statements understood by every driver.
//!
//! The workload is fixed, so instead of shipping SQL text through the
//! engine each operation is a variant and drivers render it natively.

use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BenchError, BenchResult};

/// One of the four benchmark tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableKind {
    Branches,
    Tellers,
    Accounts,
    History,
}

impl TableKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Branches => "branches",
            Self::Tellers => "tellers",
            Self::Accounts => "accounts",
            Self::History => "history",
        }
    }
}

/// Row appended to the history table by every committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub tid: i64,
    pub bid: i64,
    pub aid: i64,
    pub delta: i64,
    pub mtime: DateTime<Utc>,
}

/// Operation sent to a [`Session`](crate::traits::Session).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// Creates the table set if absent.
    CreateTables,
    /// Drops the table set if present.
    DropTables,
    /// Inserts or resets one branch row.
    UpsertBranch { bid: i64 },
    /// Inserts or resets every teller of a branch.
    UpsertTellers { bid: i64 },
    /// Inserts or resets a batch of accounts belonging to `bid`.
    UpsertAccounts { bid: i64, aids: Range<i64> },
    /// Reads the balance of one branch, teller or account.
    ReadBalance { table: TableKind, id: i64 },
    /// Adds `delta` to the balance of one branch, teller or account.
    AddBalance { table: TableKind, id: i64, delta: i64 },
    /// Appends a history row.
    InsertHistory(HistoryRow),
    /// Counts rows of a table.
    CountRows(TableKind),
}

impl Statement {
    /// Short label used in log lines.
    pub fn label(&self) -> &'static str {
        match self {
            Self::CreateTables => "create_tables",
            Self::DropTables => "drop_tables",
            Self::UpsertBranch { .. } => "upsert_branch",
            Self::UpsertTellers { .. } => "upsert_tellers",
            Self::UpsertAccounts { .. } => "upsert_accounts",
            Self::ReadBalance { .. } => "read_balance",
            Self::AddBalance { .. } => "add_balance",
            Self::InsertHistory(_) => "insert_history",
            Self::CountRows(_) => "count_rows",
        }
    }
}

/// Result of executing a [`Statement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementOutput {
    /// Statement completed and touched `rows` rows.
    Done { rows: u64 },
    /// Balance read by [`Statement::ReadBalance`].
    Balance(i64),
    /// Row count read by [`Statement::CountRows`].
    Count(i64),
}

impl StatementOutput {
    pub fn balance(self) -> BenchResult<i64> {
        match self {
            Self::Balance(balance) => Ok(balance),
            other => Err(BenchError::Statement(format!(
                "expected a balance, driver returned {other:?}"
            ))),
        }
    }

    pub fn count(self) -> BenchResult<i64> {
        match self {
            Self::Count(count) => Ok(count),
            other => Err(BenchError::Statement(format!(
                "expected a row count, driver returned {other:?}"
            ))),
        }
    }
}
