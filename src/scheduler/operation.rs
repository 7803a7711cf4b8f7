//! Units of work flowing through the scheduler

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{Executor, SqliteConnection, Statement as _};
use tokio::sync::{OwnedSemaphorePermit, oneshot};
use tokio::time::Instant;

use crate::decode::{Row, decode_rows};
use crate::health::{self, EngineState};
use crate::statement_cache::{PreparedStatement, StatementCache};
use crate::transactions::TransactionStep;
use crate::value::{SqlValue, bind_all};
use crate::{Error, Result};

/// Result returned from write operations (e.g. INSERT, UPDATE, DELETE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResult {
   /// The number of rows changed by the statement.
   pub changes: u64,
   /// The last inserted row ID (SQLite ROWID).
   ///
   /// Only meaningful for INSERT operations on tables with a ROWID.
   pub last_insert_rowid: i64,
}

/// Lifecycle of a scheduled operation.
///
/// `Queued -> Running -> {Completed | Failed | TimedOut | Aborted}`. An
/// operation can also leave `Queued` directly as `TimedOut` (queue timeout) or
/// `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
   Queued,
   Running,
   Completed,
   Failed,
   TimedOut,
   Aborted,
}

impl OperationState {
   pub(crate) fn of<T>(result: &Result<T>) -> Self {
      match result {
         Ok(_) => OperationState::Completed,
         Err(Error::Timeout(_) | Error::QueueTimeout { .. }) => OperationState::TimedOut,
         Err(Error::Aborted) => OperationState::Aborted,
         Err(_) => OperationState::Failed,
      }
   }
}

/// Work that can be re-run as a whole when it hits lock contention.
pub(crate) enum OperationKind {
   Query {
      sql: String,
      params: Vec<SqlValue>,
   },
   Execute {
      sql: String,
      params: Vec<SqlValue>,
   },
   QueryPrepared {
      statement: Arc<PreparedStatement>,
      params: Vec<SqlValue>,
   },
   ExecutePrepared {
      statement: Arc<PreparedStatement>,
      params: Vec<SqlValue>,
   },
   Prepare {
      sql: String,
   },
   Diagnostics,
}

impl OperationKind {
   pub(crate) fn label(&self) -> &'static str {
      match self {
         OperationKind::Query { .. } => "query",
         OperationKind::Execute { .. } => "execute",
         OperationKind::QueryPrepared { .. } => "query_prepared",
         OperationKind::ExecutePrepared { .. } => "execute_prepared",
         OperationKind::Prepare { .. } => "get_statement",
         OperationKind::Diagnostics => "diagnostics",
      }
   }
}

impl fmt::Debug for OperationKind {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         OperationKind::Query { sql, .. } | OperationKind::Execute { sql, .. } => {
            write!(f, "{}({sql})", self.label())
         }
         OperationKind::QueryPrepared { statement, .. }
         | OperationKind::ExecutePrepared { statement, .. } => {
            write!(f, "{}({})", self.label(), statement.sql())
         }
         OperationKind::Prepare { sql } => write!(f, "prepare({sql})"),
         OperationKind::Diagnostics => f.write_str("diagnostics"),
      }
   }
}

/// Everything the scheduler can queue.
///
/// Transactions own their step closures and run exactly once, so they are
/// kept apart from the re-runnable kinds the retry loop borrows.
pub(crate) enum Operation {
   Single(OperationKind),
   Transaction { steps: Vec<TransactionStep> },
}

impl Operation {
   pub(crate) fn label(&self) -> &'static str {
      match self {
         Operation::Single(kind) => kind.label(),
         Operation::Transaction { .. } => "transaction",
      }
   }

   pub(crate) fn is_transaction(&self) -> bool {
      matches!(self, Operation::Transaction { .. })
   }
}

impl From<OperationKind> for Operation {
   fn from(kind: OperationKind) -> Self {
      Operation::Single(kind)
   }
}

impl fmt::Debug for Operation {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Operation::Single(kind) => fmt::Debug::fmt(kind, f),
         Operation::Transaction { steps } => write!(f, "transaction({} steps)", steps.len()),
      }
   }
}

pub(crate) enum OperationOutput {
   Rows(Vec<Row>),
   Executed(ExecuteResult),
   Committed(Vec<ExecuteResult>),
   Prepared(Arc<PreparedStatement>),
   Diagnostics(EngineState),
}

impl OperationOutput {
   fn kind(&self) -> &'static str {
      match self {
         OperationOutput::Rows(_) => "rows",
         OperationOutput::Executed(_) => "execute result",
         OperationOutput::Committed(_) => "transaction results",
         OperationOutput::Prepared(_) => "prepared statement",
         OperationOutput::Diagnostics(_) => "diagnostics",
      }
   }

   fn unexpected(self, expected: &str) -> Error {
      Error::Other(format!(
         "scheduler returned {} where {} were expected",
         self.kind(),
         expected
      ))
   }

   pub(crate) fn into_rows(self) -> Result<Vec<Row>> {
      match self {
         OperationOutput::Rows(rows) => Ok(rows),
         other => Err(other.unexpected("rows")),
      }
   }

   pub(crate) fn into_executed(self) -> Result<ExecuteResult> {
      match self {
         OperationOutput::Executed(result) => Ok(result),
         other => Err(other.unexpected("an execute result")),
      }
   }

   pub(crate) fn into_committed(self) -> Result<Vec<ExecuteResult>> {
      match self {
         OperationOutput::Committed(results) => Ok(results),
         other => Err(other.unexpected("transaction results")),
      }
   }

   pub(crate) fn into_prepared(self) -> Result<Arc<PreparedStatement>> {
      match self {
         OperationOutput::Prepared(statement) => Ok(statement),
         other => Err(other.unexpected("a prepared statement")),
      }
   }

   pub(crate) fn into_diagnostics(self) -> Result<EngineState> {
      match self {
         OperationOutput::Diagnostics(state) => Ok(state),
         other => Err(other.unexpected("diagnostics")),
      }
   }
}

/// An operation waiting in (or just taken from) the queue.
pub(crate) struct PendingOperation {
   pub(crate) id: u64,
   pub(crate) operation: Operation,
   /// Budget for the Running state
   pub(crate) timeout: Duration,
   pub(crate) enqueued_at: Instant,
   /// Completion channel; receives exactly one outcome
   pub(crate) reply: oneshot::Sender<Result<OperationOutput>>,
   /// Queue slot, released when the operation is dropped
   pub(crate) _slot: OwnedSemaphorePermit,
}

/// Run one attempt of a re-runnable operation.
pub(crate) async fn run_attempt(
   conn: &mut SqliteConnection,
   kind: &OperationKind,
   cache: &StatementCache,
) -> Result<OperationOutput> {
   match kind {
      OperationKind::Query { sql, params } => {
         fetch_rows(conn, sql, params).await.map(OperationOutput::Rows)
      }
      OperationKind::Execute { sql, params } => execute_statement(conn, sql, params)
         .await
         .map(OperationOutput::Executed),
      OperationKind::QueryPrepared { statement, params } => {
         cache.ensure_current(statement)?;
         let query = bind_all(statement.inner().query(), params);
         let rows = query.fetch_all(&mut *conn).await?;
         decode_rows(rows).map(OperationOutput::Rows)
      }
      OperationKind::ExecutePrepared { statement, params } => {
         cache.ensure_current(statement)?;
         let query = bind_all(statement.inner().query(), params);
         let result = query.execute(&mut *conn).await?;
         Ok(OperationOutput::Executed(ExecuteResult {
            changes: result.rows_affected(),
            last_insert_rowid: result.last_insert_rowid(),
         }))
      }
      OperationKind::Prepare { sql } => {
         if let Some(statement) = cache.get(sql) {
            return Ok(OperationOutput::Prepared(statement));
         }
         let statement = (&mut *conn).prepare(sql.as_str()).await?;
         let statement = sqlx::Statement::to_owned(&statement);
         Ok(OperationOutput::Prepared(cache.insert(sql, statement)))
      }
      OperationKind::Diagnostics => health::read_engine_state(conn)
         .await
         .map(OperationOutput::Diagnostics),
   }
}

pub(crate) async fn fetch_rows(
   conn: &mut SqliteConnection,
   sql: &str,
   params: &[SqlValue],
) -> Result<Vec<Row>> {
   let query = bind_all(sqlx::query(sql), params);
   let rows = query.fetch_all(&mut *conn).await?;
   decode_rows(rows)
}

pub(crate) async fn execute_statement(
   conn: &mut SqliteConnection,
   sql: &str,
   params: &[SqlValue],
) -> Result<ExecuteResult> {
   let query = bind_all(sqlx::query(sql), params);
   let result = query.execute(&mut *conn).await?;
   Ok(ExecuteResult {
      changes: result.rows_affected(),
      last_insert_rowid: result.last_insert_rowid(),
   })
}
