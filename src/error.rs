use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SQLite primary result codes that signal lock contention.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Error types for the storage manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// The database file could not be opened or its pragmas applied. Fatal for
   /// the calling process.
   #[error("failed to initialize storage at {path}: {source}")]
   Initialization {
      path: PathBuf,
      #[source]
      source: Box<Error>,
   },

   /// Called from a process that does not own the connection.
   #[error(
      "`{operation}` was called from {context}, which does not own the storage connection; send the request over the '{channel}' message channel instead"
   )]
   CrossProcessAccess {
      operation: &'static str,
      context: String,
      channel: String,
   },

   /// The operation waited in the queue past its budget and never ran.
   #[error("operation waited {waited:?} in the queue (limit {limit:?}) and was never started")]
   QueueTimeout { waited: Duration, limit: Duration },

   /// The operation started but did not finish in time. Whether it took
   /// effect is unknown; re-read before retrying a write.
   #[error("operation did not complete within {0:?}; its outcome is unknown")]
   Timeout(Duration),

   /// Cancelled by `abort_pending_operations`.
   #[error("operation aborted")]
   Aborted,

   /// A transaction step failed and the transaction was rolled back.
   #[error("transaction rolled back after step {step} failed: {source}")]
   Transaction {
      step: usize,
      #[source]
      source: Box<Error>,
   },

   /// Transaction failed and rollback also failed.
   #[error("transaction failed: {transaction_error}; rollback also failed: {rollback_error}")]
   TransactionRollbackFailed {
      transaction_error: String,
      rollback_error: String,
   },

   /// A storage call was made from inside a running transaction step.
   #[error(
      "`{0}` cannot be called from inside a transaction step; use the connection passed to the step"
   )]
   NestedOperation(&'static str),

   /// Error reported by the SQLite engine (constraint, syntax, busy...).
   #[error(transparent)]
   Engine(#[from] sqlx::Error),

   /// Error from the connection manager.
   #[error(transparent)]
   ConnectionManager(#[from] sqlx_sqlite_conn_mgr::Error),

   /// `initialize` has not been called (or the manager was closed).
   #[error("storage has not been initialized")]
   NotInitialized,

   /// The manager is shutting down and no longer accepts operations.
   #[error("storage is closed")]
   Closed,

   /// A prepared statement from an earlier connection lifetime was used.
   #[error("prepared statement belongs to a closed connection: {0}")]
   StaleStatement(String),

   /// Multiple rows returned from `query_one`.
   #[error("query_one() returned {0} rows, expected 0 or 1")]
   MultipleRowsReturned(usize),

   /// A live instance exists with a different configuration.
   #[error("storage is already open with a different configuration (path {existing})")]
   ConfigurationMismatch { existing: PathBuf },

   /// Configuration values are out of range.
   #[error("invalid storage configuration: {0}")]
   InvalidConfiguration(String),

   /// A destructive test hook was called without a test-mode configuration.
   #[error("`{0}` is only available when the storage is configured in test mode")]
   TestModeRequired(&'static str),

   /// SQLite type that cannot be mapped to JSON.
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// Row could not be deserialized into the requested type.
   #[error("failed to deserialize row: {0}")]
   Deserialize(#[from] serde_json::Error),

   /// Generic error for operations that don't fit other categories.
   #[error("{0}")]
   Other(String),
}

impl Error {
   /// Whether this is a busy/locked failure worth retrying.
   pub fn is_transient(&self) -> bool {
      match self {
         Error::Engine(e) => sqlite_code(e).is_some_and(is_contention_code),
         _ => false,
      }
   }

   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      match self {
         Error::Engine(e) => {
            if let Some(code) = sqlite_code(e) {
               return format!("SQLITE_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
         Error::Initialization { .. } => "INITIALIZATION_ERROR".to_string(),
         Error::CrossProcessAccess { .. } => "CROSS_PROCESS_ACCESS".to_string(),
         Error::QueueTimeout { .. } => "QUEUE_TIMEOUT".to_string(),
         Error::Timeout(_) => "TIMEOUT".to_string(),
         Error::Aborted => "ABORTED".to_string(),
         Error::Transaction { .. } => "TRANSACTION_ERROR".to_string(),
         Error::TransactionRollbackFailed { .. } => "TRANSACTION_ROLLBACK_FAILED".to_string(),
         Error::NestedOperation(_) => "NESTED_OPERATION".to_string(),
         Error::ConnectionManager(_) => "CONNECTION_ERROR".to_string(),
         Error::NotInitialized => "NOT_INITIALIZED".to_string(),
         Error::Closed => "CLOSED".to_string(),
         Error::StaleStatement(_) => "STALE_STATEMENT".to_string(),
         Error::MultipleRowsReturned(_) => "MULTIPLE_ROWS_RETURNED".to_string(),
         Error::ConfigurationMismatch { .. } => "CONFIGURATION_MISMATCH".to_string(),
         Error::InvalidConfiguration(_) => "INVALID_CONFIGURATION".to_string(),
         Error::TestModeRequired(_) => "TEST_MODE_REQUIRED".to_string(),
         Error::UnsupportedDatatype(_) => "UNSUPPORTED_DATATYPE".to_string(),
         Error::Deserialize(_) => "DESERIALIZE_ERROR".to_string(),
         Error::Other(_) => "ERROR".to_string(),
      }
   }
}

/// Numeric SQLite result code (possibly extended) carried by a sqlx error.
fn sqlite_code(err: &sqlx::Error) -> Option<i32> {
   err.as_database_error()
      .and_then(|db_err| db_err.code())
      .and_then(|code| code.parse().ok())
}

/// Extended codes keep the primary code in the low byte
/// (`SQLITE_BUSY_SNAPSHOT` = 517 = 5 | 2 << 8).
pub(crate) fn is_contention_code(code: i32) -> bool {
   matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED)
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_contention_codes() {
      assert!(is_contention_code(5));
      assert!(is_contention_code(6));
      // SQLITE_BUSY_RECOVERY, SQLITE_BUSY_SNAPSHOT, SQLITE_LOCKED_SHAREDCACHE
      assert!(is_contention_code(261));
      assert!(is_contention_code(517));
      assert!(is_contention_code(262));

      // SQLITE_CONSTRAINT_NOTNULL, SQLITE_ERROR, SQLITE_INTERRUPT
      assert!(!is_contention_code(1299));
      assert!(!is_contention_code(1));
      assert!(!is_contention_code(9));
   }

   #[test]
   fn test_non_engine_errors_are_not_transient() {
      assert!(!Error::Aborted.is_transient());
      assert!(!Error::Timeout(Duration::from_secs(1)).is_transient());
      assert!(!Error::Engine(sqlx::Error::RowNotFound).is_transient());
   }

   #[test]
   fn test_error_code_cross_process_access() {
      let err = Error::CrossProcessAccess {
         operation: "query",
         context: "process 42".into(),
         channel: "storage:request".into(),
      };
      assert_eq!(err.error_code(), "CROSS_PROCESS_ACCESS");
      assert!(err.to_string().contains("storage:request"));
      assert!(err.to_string().contains("process 42"));
   }

   #[test]
   fn test_error_code_timeouts() {
      let err = Error::QueueTimeout {
         waited: Duration::from_millis(120),
         limit: Duration::from_millis(100),
      };
      assert_eq!(err.error_code(), "QUEUE_TIMEOUT");
      assert!(err.to_string().contains("never started"));

      let err = Error::Timeout(Duration::from_millis(50));
      assert_eq!(err.error_code(), "TIMEOUT");
      assert!(err.to_string().contains("unknown"));
   }

   #[test]
   fn test_error_code_transaction() {
      let err = Error::Transaction {
         step: 3,
         source: Box::new(Error::Other("boom".into())),
      };
      assert_eq!(err.error_code(), "TRANSACTION_ERROR");
      assert!(err.to_string().contains("step 3"));
      assert!(err.to_string().contains("boom"));
   }

   #[test]
   fn test_error_code_transaction_rollback_failed() {
      let err = Error::TransactionRollbackFailed {
         transaction_error: "constraint".into(),
         rollback_error: "busy".into(),
      };
      assert_eq!(err.error_code(), "TRANSACTION_ROLLBACK_FAILED");
      assert!(err.to_string().contains("constraint"));
      assert!(err.to_string().contains("busy"));
   }

   #[test]
   fn test_error_code_multiple_rows_returned() {
      let err = Error::MultipleRowsReturned(5);
      assert_eq!(err.error_code(), "MULTIPLE_ROWS_RETURNED");
      assert!(err.to_string().contains("5 rows"));
   }

   #[test]
   fn test_error_code_sqlx_non_database() {
      // RowNotFound is not a database error, so no SQLite code
      let err = Error::Engine(sqlx::Error::RowNotFound);
      assert_eq!(err.error_code(), "SQLX_ERROR");
   }

   #[test]
   fn test_error_code_other() {
      let err = Error::Other("something went wrong".into());
      assert_eq!(err.error_code(), "ERROR");
      assert_eq!(err.to_string(), "something went wrong");
   }
}
