//! Atomic execution of transaction steps

use std::fmt;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::scheduler::operation::{ExecuteResult, execute_statement};
use crate::scheduler::retry;
use crate::value::SqlValue;
use crate::{Error, Result};

/// Statement in a transaction with query and bind values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
   pub sql: String,
   #[serde(default)]
   pub params: Vec<SqlValue>,
}

impl Statement {
   pub fn new(sql: impl Into<String>) -> Self {
      Self {
         sql: sql.into(),
         params: Vec::new(),
      }
   }

   pub fn with_params(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
      Self {
         sql: sql.into(),
         params,
      }
   }
}

/// Boxed custom step; receives the connection the transaction runs on.
pub type StepFn =
   Box<dyn for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<()>> + Send>;

/// One unit of work inside a transaction.
pub enum TransactionStep {
   /// Run a single statement
   Statement(Statement),
   /// Run arbitrary code against the transaction's connection. Returning an
   /// error rolls the whole transaction back.
   Custom(StepFn),
}

impl TransactionStep {
   pub fn statement(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
      TransactionStep::Statement(Statement::with_params(sql, params))
   }

   /// Wrap an async closure as a step.
   ///
   /// ```ignore
   /// TransactionStep::custom(|conn| Box::pin(async move {
   ///     sqlx::query("DELETE FROM settings").execute(conn).await?;
   ///     Ok::<_, app_storage::Error>(())
   /// }))
   /// ```
   pub fn custom<F>(step: F) -> Self
   where
      F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<()>> + Send + 'static,
   {
      TransactionStep::Custom(Box::new(step))
   }
}

impl From<Statement> for TransactionStep {
   fn from(statement: Statement) -> Self {
      TransactionStep::Statement(statement)
   }
}

impl fmt::Debug for TransactionStep {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         TransactionStep::Statement(s) => f.debug_tuple("Statement").field(s).finish(),
         TransactionStep::Custom(_) => f.write_str("Custom(..)"),
      }
   }
}

/// Run `steps` atomically on `conn`.
///
/// This method:
/// 1. Begins a transaction (BEGIN IMMEDIATE), retrying busy/locked failures
/// 2. Executes all steps in order
/// 3. Commits on success (COMMIT)
/// 4. Rolls back on any error (ROLLBACK)
///
/// Returns one result per statement step; custom steps produce none. A failed
/// step is reported as [`Error::Transaction`] with its 1-based position.
pub(crate) async fn run(
   conn: &mut SqliteConnection,
   steps: Vec<TransactionStep>,
   policy: &RetryPolicy,
) -> Result<Vec<ExecuteResult>> {
   begin_immediate(conn, policy).await?;

   let step_count = steps.len();
   let mut results = Vec::new();
   let mut failure = None;

   for (index, step) in steps.into_iter().enumerate() {
      let outcome = match step {
         TransactionStep::Statement(statement) => {
            execute_statement(conn, &statement.sql, &statement.params)
               .await
               .map(|result| results.push(result))
         }
         TransactionStep::Custom(step) => step(&mut *conn).await,
      };

      if let Err(e) = outcome {
         failure = Some((index + 1, e));
         break;
      }
   }

   match failure {
      None => match sqlx::query("COMMIT").execute(&mut *conn).await {
         Ok(_) => {
            debug!(steps = step_count, "Transaction committed");
            Ok(results)
         }
         Err(commit_err) => rollback_after(conn, Error::Engine(commit_err)).await,
      },
      Some((step, e)) => {
         warn!(step, error = %e, "Transaction step failed, rolling back");
         let error = Error::Transaction {
            step,
            source: Box::new(e),
         };
         rollback_after(conn, error).await
      }
   }
}

async fn begin_immediate(conn: &mut SqliteConnection, policy: &RetryPolicy) -> Result<()> {
   let mut attempt = 1;
   loop {
      match sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await {
         Ok(_) => return Ok(()),
         Err(e) => {
            let e = Error::Engine(e);
            if !retry::backoff(policy, attempt, &e).await {
               return Err(e);
            }
            attempt += 1;
         }
      }
   }
}

/// Roll back and return `original`, or both errors if the rollback fails too.
async fn rollback_after<T>(conn: &mut SqliteConnection, original: Error) -> Result<T> {
   match sqlx::query("ROLLBACK").execute(&mut *conn).await {
      // Rollback succeeded, return original error
      Ok(_) => {
         debug!("Transaction rolled back");
         Err(original)
      }

      // Rollback also failed, return the rollback error and the original error
      Err(rollback_err) => Err(Error::TransactionRollbackFailed {
         transaction_error: original.to_string(),
         rollback_error: rollback_err.to_string(),
      }),
   }
}

/// Best-effort rollback after an abandoned transaction.
///
/// Errors are expected when SQLite already rolled back (for example after an
/// interrupt) and are only logged.
pub(crate) async fn rollback_quietly(conn: &mut SqliteConnection) {
   if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
      debug!(error = %e, "Rollback after abandoned transaction reported an error");
   }
}
