use async_trait::async_trait;

use crate::error::BenchResult;
use crate::statement::{Statement, StatementOutput};

/// Factory for database sessions.
///
/// A connector is shared by every worker of a process; each call to
/// [`Connector::connect`] yields a session owned by exactly one worker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new session. Fails with `BenchError::Connection`.
    async fn connect(&self) -> BenchResult<Box<dyn Session>>;

    /// True when the target keeps no state beyond the current process.
    ///
    /// Ephemeral targets are provisioned by the process that runs against them.
    fn is_ephemeral(&self) -> bool {
        false
    }

    /// Human-readable target description for logs (no credentials).
    fn describe(&self) -> String;
}

/// One logical database session.
///
/// Statements executed between [`Session::begin`] and [`Session::commit`]
/// take effect atomically. Every method may fail with `Conflict`,
/// `Transient`, `Constraint`, `Statement` or `Fatal`.
#[async_trait]
pub trait Session: Send {
    /// Starts an explicit transaction.
    async fn begin(&mut self) -> BenchResult<()>;

    /// Executes one statement, inside the current transaction if any.
    async fn execute(&mut self, statement: &Statement) -> BenchResult<StatementOutput>;

    /// Commits the current transaction.
    async fn commit(&mut self) -> BenchResult<()>;

    /// Rolls back the current transaction. A no-op when none is open.
    async fn rollback(&mut self) -> BenchResult<()>;

    /// Closes the session.
    async fn close(self: Box<Self>) -> BenchResult<()>;

    /// Runs `statements` in one transaction and returns their outputs.
    ///
    /// Rolls back and returns the first error if any statement fails.
    async fn execute_batch(&mut self, statements: &[Statement]) -> BenchResult<Vec<StatementOutput>> {
        self.begin().await?;
        let mut outputs = Vec::with_capacity(statements.len());
        for statement in statements {
            match self.execute(statement).await {
                Ok(output) => outputs.push(output),
                Err(err) => {
                    if let Err(rollback_err) = self.rollback().await {
                        tracing::debug!("rollback after failed {} also failed: {}", statement.label(), rollback_err);
                    }
                    return Err(err);
                }
            }
        }
        self.commit().await?;
        Ok(outputs)
    }
}
