//! In-process database with optimistic concurrency control.
//!
//! Every transaction records the version of each row it reads; at commit the
//! versions are validated under the database lock and the commit fails with
//! `Conflict` if any of them moved. Writes are buffered in the transaction
//! and become visible atomically, so a failed transaction leaves no trace.
//!
//! Databases are registered process-wide by name: every `memory://<name>`
//! connector in one process talks to the same instance. Nothing is shared
//! across processes.
//!
//! # Fault injection
//!
//! Faults are consumed in order by [`Session::execute`] and
//! [`Session::commit`] calls (not by `begin`), modeled on a mock object
//! store's failure queue:
//!
//! ```rust
//! use txbench_driver::{MemoryConfig, MemoryDatabase, MemoryFault};
//!
//! let database = MemoryDatabase::new("doc", MemoryConfig::default());
//! database.inject_faults([
//!     MemoryFault::Ok,
//!     MemoryFault::Conflict("first writer wins"),
//! ]);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::debug;
use txbench_core::{
    BenchError, BenchResult, Connector, HistoryRow, ScaleModel, Session, Statement,
    StatementOutput, TableKind, INITIAL_BALANCE,
};

static REGISTRY: Lazy<Mutex<HashMap<String, Arc<MemoryDatabase>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Injected outcome for the next `execute` or `commit` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryFault {
    /// Let the call through.
    Ok,
    Conflict(&'static str),
    Transient(&'static str),
    Constraint(&'static str),
    Statement(&'static str),
    Fatal(&'static str),
}

impl MemoryFault {
    fn to_error(self) -> Option<BenchError> {
        match self {
            MemoryFault::Ok => None,
            MemoryFault::Conflict(msg) => Some(BenchError::Conflict(msg.to_string())),
            MemoryFault::Transient(msg) => Some(BenchError::Transient(msg.to_string())),
            MemoryFault::Constraint(msg) => Some(BenchError::Constraint(msg.to_string())),
            MemoryFault::Statement(msg) => Some(BenchError::Statement(msg.to_string())),
            MemoryFault::Fatal(msg) => Some(BenchError::Fatal(msg.to_string())),
        }
    }
}

/// Memory database configuration.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    /// Simulated round-trip latency per call. Zero still yields to the runtime.
    pub latency: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Row {
    balance: i64,
    version: u64,
}

#[derive(Debug, Default)]
struct TableSet {
    branches: HashMap<i64, Row>,
    tellers: HashMap<i64, Row>,
    accounts: HashMap<i64, Row>,
    history: Vec<HistoryRow>,
}

impl TableSet {
    fn rows(&self, table: TableKind) -> BenchResult<&HashMap<i64, Row>> {
        match table {
            TableKind::Branches => Ok(&self.branches),
            TableKind::Tellers => Ok(&self.tellers),
            TableKind::Accounts => Ok(&self.accounts),
            TableKind::History => Err(no_balance_column()),
        }
    }

    fn rows_mut(&mut self, table: TableKind) -> BenchResult<&mut HashMap<i64, Row>> {
        match table {
            TableKind::Branches => Ok(&mut self.branches),
            TableKind::Tellers => Ok(&mut self.tellers),
            TableKind::Accounts => Ok(&mut self.accounts),
            TableKind::History => Err(no_balance_column()),
        }
    }

    fn count(&self, table: TableKind) -> i64 {
        let count = match table {
            TableKind::Branches => self.branches.len(),
            TableKind::Tellers => self.tellers.len(),
            TableKind::Accounts => self.accounts.len(),
            TableKind::History => self.history.len(),
        };
        count as i64
    }
}

fn no_balance_column() -> BenchError {
    BenchError::Statement("history rows have no balance".to_string())
}

/// A named in-process database holding one table set per prefix.
pub struct MemoryDatabase {
    name: String,
    config: MemoryConfig,
    schemas: RwLock<HashMap<String, TableSet>>,
    faults: Mutex<VecDeque<MemoryFault>>,
    persistent_fault: Mutex<Option<MemoryFault>>,
    refuse_connections: AtomicBool,
    commits: AtomicU64,
    conflicts: AtomicU64,
}

impl MemoryDatabase {
    /// Creates a standalone database that is not visible through the registry.
    pub fn new(name: &str, config: MemoryConfig) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            config,
            schemas: RwLock::new(HashMap::new()),
            faults: Mutex::new(VecDeque::new()),
            persistent_fault: Mutex::new(None),
            refuse_connections: AtomicBool::new(false),
            commits: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
        })
    }

    /// Returns the process-wide database called `name`, creating it on first use.
    ///
    /// `config` only applies when the database is created.
    pub fn open(name: &str, config: MemoryConfig) -> Arc<Self> {
        REGISTRY
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Self::new(name, config))
            .clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends faults to the injection queue.
    pub fn inject_faults(&self, faults: impl IntoIterator<Item = MemoryFault>) {
        self.faults.lock().extend(faults);
    }

    /// Fault returned once the queue is drained (`None` to stop failing).
    pub fn fail_always(&self, fault: Option<MemoryFault>) {
        *self.persistent_fault.lock() = fault;
    }

    /// Makes subsequent `connect` calls fail with a connection error.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Number of committed transactions.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Number of conflicts reported, injected ones included.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    /// Committed balance of one row, if the table set and the row exist.
    pub fn balance(&self, prefix: &str, table: TableKind, id: i64) -> Option<i64> {
        let schemas = self.schemas.read();
        let tables = schemas.get(prefix)?;
        tables.rows(table).ok()?.get(&id).map(|row| row.balance)
    }

    /// Committed row count of a table, if the table set exists.
    pub fn row_count(&self, prefix: &str, table: TableKind) -> Option<i64> {
        self.schemas.read().get(prefix).map(|tables| tables.count(table))
    }

    fn next_fault(&self) -> Option<BenchError> {
        let fault = self
            .faults
            .lock()
            .pop_front()
            .or(*self.persistent_fault.lock())?;
        let error = fault.to_error()?;
        if matches!(error, BenchError::Conflict(_)) {
            self.conflicts.fetch_add(1, Ordering::Relaxed);
        }
        Some(error)
    }

    async fn round_trip(&self) {
        if self.config.latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.config.latency).await;
        }
    }
}

/// Connector for a [`MemoryDatabase`] table set.
pub struct MemoryConnector {
    database: Arc<MemoryDatabase>,
    prefix: String,
}

impl MemoryConnector {
    pub fn new(database: Arc<MemoryDatabase>, prefix: &str) -> Self {
        Self {
            database,
            prefix: prefix.to_string(),
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> BenchResult<Box<dyn Session>> {
        self.database.round_trip().await;
        if self.database.refuse_connections.load(Ordering::SeqCst) {
            return Err(BenchError::connection(format!(
                "memory database '{}' refused the connection",
                self.database.name
            )));
        }
        Ok(Box::new(MemorySession {
            database: Arc::clone(&self.database),
            prefix: self.prefix.clone(),
            transaction: None,
        }))
    }

    fn is_ephemeral(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        format!("memory://{} (prefix {})", self.database.name, self.prefix)
    }
}

#[derive(Default)]
struct Transaction {
    /// Row versions observed by reads.
    reads: HashMap<(TableKind, i64), u64>,
    /// Buffered row images, applied at commit.
    writes: HashMap<(TableKind, i64), Row>,
    history: Vec<HistoryRow>,
    aborted: bool,
}

/// One session against a [`MemoryDatabase`].
pub struct MemorySession {
    database: Arc<MemoryDatabase>,
    prefix: String,
    transaction: Option<Transaction>,
}

impl MemorySession {
    fn missing_tables(&self) -> BenchError {
        BenchError::Statement(format!(
            "tables under prefix '{}' do not exist",
            self.prefix
        ))
    }

    fn ensure_tables(&self) -> BenchResult<()> {
        if self.database.schemas.read().contains_key(&self.prefix) {
            Ok(())
        } else {
            Err(self.missing_tables())
        }
    }

    /// Latest image of a row as seen by `transaction`, recording the read.
    fn read_row(&self, transaction: &mut Transaction, table: TableKind, id: i64) -> BenchResult<Row> {
        if let Some(row) = transaction.writes.get(&(table, id)) {
            return Ok(*row);
        }

        let schemas = self.database.schemas.read();
        let tables = schemas
            .get(&self.prefix)
            .ok_or_else(|| self.missing_tables())?;
        let row = *tables.rows(table)?.get(&id).ok_or_else(|| {
            BenchError::Statement(format!("no {} row with id {}", table.name(), id))
        })?;
        transaction.reads.entry((table, id)).or_insert(row.version);
        Ok(row)
    }

    fn apply(&self, transaction: &mut Transaction, statement: &Statement) -> BenchResult<StatementOutput> {
        match statement {
            Statement::CreateTables => {
                self.database
                    .schemas
                    .write()
                    .entry(self.prefix.clone())
                    .or_default();
                Ok(StatementOutput::Done { rows: 0 })
            }
            Statement::DropTables => {
                self.database.schemas.write().remove(&self.prefix);
                Ok(StatementOutput::Done { rows: 0 })
            }
            Statement::UpsertBranch { bid } => {
                self.ensure_tables()?;
                stage_row(transaction, TableKind::Branches, *bid);
                Ok(StatementOutput::Done { rows: 1 })
            }
            Statement::UpsertTellers { bid } => {
                self.ensure_tables()?;
                let tellers = ScaleModel::teller_range(*bid);
                let rows = (tellers.end - tellers.start) as u64;
                for tid in tellers {
                    stage_row(transaction, TableKind::Tellers, tid);
                }
                Ok(StatementOutput::Done { rows })
            }
            Statement::UpsertAccounts { aids, .. } => {
                self.ensure_tables()?;
                for aid in aids.clone() {
                    stage_row(transaction, TableKind::Accounts, aid);
                }
                Ok(StatementOutput::Done {
                    rows: (aids.end - aids.start).max(0) as u64,
                })
            }
            Statement::ReadBalance { table, id } => {
                let row = self.read_row(transaction, *table, *id)?;
                Ok(StatementOutput::Balance(row.balance))
            }
            Statement::AddBalance { table, id, delta } => {
                let mut row = self.read_row(transaction, *table, *id)?;
                row.balance = row.balance.checked_add(*delta).ok_or_else(|| {
                    BenchError::Constraint(format!("{} balance overflow", table.name()))
                })?;
                transaction.writes.insert((*table, *id), row);
                Ok(StatementOutput::Done { rows: 1 })
            }
            Statement::InsertHistory(row) => {
                self.ensure_tables()?;
                transaction.history.push(row.clone());
                Ok(StatementOutput::Done { rows: 1 })
            }
            Statement::CountRows(table) => {
                let schemas = self.database.schemas.read();
                let tables = schemas
                    .get(&self.prefix)
                    .ok_or_else(|| self.missing_tables())?;
                Ok(StatementOutput::Count(tables.count(*table)))
            }
        }
    }

    /// Validates the read set and publishes the write set atomically.
    fn publish(&self, transaction: Transaction) -> BenchResult<()> {
        let mut schemas = self.database.schemas.write();
        let tables = match schemas.get_mut(&self.prefix) {
            Some(tables) => tables,
            None if transaction.writes.is_empty() && transaction.history.is_empty() => {
                return Ok(())
            }
            None => return Err(self.missing_tables()),
        };

        for (&(table, id), &version) in &transaction.reads {
            let current = tables.rows(table)?.get(&id).map(|row| row.version);
            if current != Some(version) {
                self.database.conflicts.fetch_add(1, Ordering::Relaxed);
                return Err(BenchError::Conflict(format!(
                    "{} row {} was modified by a concurrent transaction",
                    table.name(),
                    id
                )));
            }
        }

        for ((table, id), row) in transaction.writes {
            let rows = tables.rows_mut(table)?;
            let version = rows.get(&id).map_or(1, |current| current.version + 1);
            rows.insert(id, Row { version, ..row });
        }
        tables.history.extend(transaction.history);

        self.database.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn stage_row(transaction: &mut Transaction, table: TableKind, id: i64) {
    transaction.writes.insert(
        (table, id),
        Row {
            balance: INITIAL_BALANCE,
            version: 0,
        },
    );
}

#[async_trait]
impl Session for MemorySession {
    async fn begin(&mut self) -> BenchResult<()> {
        self.database.round_trip().await;
        if self.transaction.is_some() {
            return Err(BenchError::Statement(
                "a transaction is already in progress".to_string(),
            ));
        }
        self.transaction = Some(Transaction::default());
        Ok(())
    }

    async fn execute(&mut self, statement: &Statement) -> BenchResult<StatementOutput> {
        self.database.round_trip().await;

        if let Some(error) = self.database.next_fault() {
            if let Some(transaction) = self.transaction.as_mut() {
                transaction.aborted = true;
            }
            return Err(error);
        }

        match self.transaction.take() {
            Some(mut transaction) => {
                if transaction.aborted {
                    self.transaction = Some(transaction);
                    return Err(BenchError::Statement(
                        "current transaction is aborted, commands ignored until rollback"
                            .to_string(),
                    ));
                }
                let result = self.apply(&mut transaction, statement);
                transaction.aborted = result.is_err();
                self.transaction = Some(transaction);
                result
            }
            None => {
                // Autocommit
                let mut transaction = Transaction::default();
                let output = self.apply(&mut transaction, statement)?;
                self.publish(transaction)?;
                Ok(output)
            }
        }
    }

    async fn commit(&mut self) -> BenchResult<()> {
        self.database.round_trip().await;

        let transaction = self.transaction.take().ok_or_else(|| {
            BenchError::Statement("no transaction in progress".to_string())
        })?;
        if let Some(error) = self.database.next_fault() {
            return Err(error);
        }
        if transaction.aborted {
            return Err(BenchError::Statement(
                "transaction was aborted and has been rolled back".to_string(),
            ));
        }
        self.publish(transaction)
    }

    async fn rollback(&mut self) -> BenchResult<()> {
        if self.transaction.take().is_some() {
            debug!(database = %self.database.name, "transaction rolled back");
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> BenchResult<()> {
        Ok(())
    }
}
