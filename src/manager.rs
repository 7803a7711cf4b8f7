use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx_sqlite_conn_mgr::SqliteDatabase;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::decode::Row;
use crate::guard::{OwnerProcess, ProcessContext, ProcessGuard};
use crate::health::{Diagnostics, HEALTH_CHECK_SQL};
use crate::scheduler::operation::{ExecuteResult, Operation, OperationKind};
use crate::scheduler::{Scheduler, SchedulerPolicy};
use crate::schema;
use crate::statement_cache::{PreparedStatement, StatementCache};
use crate::transactions::{Statement, TransactionStep};
use crate::value::SqlValue;
use crate::{Error, Result};

/// The storage manager: single owner of the database connection.
///
/// Construct one in the process that owns storage, call
/// [`initialize`](Self::initialize), and share it (usually as
/// `Arc<StorageManager>`) with the stores that need it. Every call is checked
/// against the owning process and then queued on the single dispatcher.
pub struct StorageManager {
   /// Resolved configuration (test-mode limits applied)
   config: StorageConfig,
   guard: ProcessGuard,
   cache: Arc<StatementCache>,
   scheduler: RwLock<Option<Arc<Scheduler>>>,
   /// Serializes initialize/close
   lifecycle: Mutex<()>,
}

impl StorageManager {
   /// Create a manager owned by the current process. Nothing is opened until
   /// [`initialize`](Self::initialize).
   pub fn new(config: StorageConfig) -> Result<Self> {
      Self::with_process_context(config, Arc::new(OwnerProcess::current()))
   }

   /// Create a manager whose ownership check is answered by `context`.
   pub fn with_process_context(
      config: StorageConfig,
      context: Arc<dyn ProcessContext>,
   ) -> Result<Self> {
      config.validate()?;
      let config = config.resolved();
      let guard = ProcessGuard::new(context, config.ipc_channel.clone());

      Ok(Self {
         config,
         guard,
         cache: Arc::new(StatementCache::default()),
         scheduler: RwLock::new(None),
         lifecycle: Mutex::new(()),
      })
   }

   pub fn config(&self) -> &StorageConfig {
      &self.config
   }

   /// Open the database, apply pragmas and bootstrap the schema.
   ///
   /// Idempotent: once initialized, further calls (including concurrent ones)
   /// return without touching the file. Calling it after [`close`](Self::close)
   /// opens a fresh connection.
   pub async fn initialize(&self) -> Result<()> {
      self.guard.check("initialize")?;
      let _lifecycle = self.lifecycle.lock().await;

      if self.is_ready() {
         return Ok(());
      }

      let path = self.config.path.clone();
      let initialization = |source: Error| Error::Initialization {
         path: path.clone(),
         source: Box::new(source),
      };

      let mut db = SqliteDatabase::open(&path, &self.config.connection_config())
         .await
         .map_err(|e| initialization(e.into()))?;

      let version = match schema::bootstrap(db.connection(), &self.config.retry).await {
         Ok(version) => version,
         Err(e) => {
            if let Err(close_err) = db.close().await {
               warn!(error = %close_err, "Failed to close database after bootstrap failure");
            }
            return Err(initialization(e));
         }
      };

      self.cache.clear();
      let scheduler = Scheduler::start(
         db,
         SchedulerPolicy::from(&self.config),
         Arc::clone(&self.cache),
      );
      *self.scheduler.write() = Some(Arc::new(scheduler));

      debug!(path = %path.display(), schema_version = version, "Storage initialized");
      Ok(())
   }

   /// Whether `initialize` has completed and `close` has not been called.
   pub fn is_ready(&self) -> bool {
      self.scheduler.read().is_some()
   }

   fn scheduler(&self, operation: &'static str) -> Result<Arc<Scheduler>> {
      self.guard.check(operation)?;
      self.scheduler.read().clone().ok_or(Error::NotInitialized)
   }

   /// Run a SELECT and return every row.
   pub async fn query(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Row>> {
      self.fetch("query", sql, params, None).await
   }

   /// [`query`](Self::query) with a per-call operation timeout.
   pub async fn query_with_timeout(
      &self,
      sql: &str,
      params: Vec<SqlValue>,
      timeout: Duration,
   ) -> Result<Vec<Row>> {
      self.fetch("query", sql, params, Some(timeout)).await
   }

   /// Run a SELECT and deserialize each row into `T`.
   pub async fn query_as<T: DeserializeOwned>(
      &self,
      sql: &str,
      params: Vec<SqlValue>,
   ) -> Result<Vec<T>> {
      let rows = self.fetch("query_as", sql, params, None).await?;
      rows
         .into_iter()
         .map(|row| {
            let object = JsonValue::Object(row.into_iter().collect());
            serde_json::from_value(object).map_err(Error::from)
         })
         .collect()
   }

   /// Run a SELECT expecting zero or one row.
   pub async fn query_one(&self, sql: &str, params: Vec<SqlValue>) -> Result<Option<Row>> {
      let mut rows = self.fetch("query_one", sql, params, None).await?;
      match rows.len() {
         0 | 1 => Ok(rows.pop()),
         count => Err(Error::MultipleRowsReturned(count)),
      }
   }

   async fn fetch(
      &self,
      operation: &'static str,
      sql: &str,
      params: Vec<SqlValue>,
      timeout: Option<Duration>,
   ) -> Result<Vec<Row>> {
      let scheduler = self.scheduler(operation)?;
      let kind = OperationKind::Query {
         sql: sql.to_string(),
         params,
      };
      scheduler.submit(kind, timeout).await?.into_rows()
   }

   /// Execute a write statement (INSERT/UPDATE/DELETE/DDL).
   pub async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<ExecuteResult> {
      self.write(sql, params, None).await
   }

   /// [`execute`](Self::execute) with a per-call operation timeout.
   pub async fn execute_with_timeout(
      &self,
      sql: &str,
      params: Vec<SqlValue>,
      timeout: Duration,
   ) -> Result<ExecuteResult> {
      self.write(sql, params, Some(timeout)).await
   }

   async fn write(
      &self,
      sql: &str,
      params: Vec<SqlValue>,
      timeout: Option<Duration>,
   ) -> Result<ExecuteResult> {
      let scheduler = self.scheduler("execute")?;
      let kind = OperationKind::Execute {
         sql: sql.to_string(),
         params,
      };
      scheduler.submit(kind, timeout).await?.into_executed()
   }

   /// Run `steps` atomically in an immediate transaction.
   ///
   /// If any step fails the whole transaction is rolled back and the failure
   /// is returned as [`Error::Transaction`]. Steps must not call back into the
   /// manager; such calls fail with [`Error::NestedOperation`].
   pub async fn transaction(&self, steps: Vec<TransactionStep>) -> Result<()> {
      let scheduler = self.scheduler("transaction")?;
      scheduler
         .submit(Operation::Transaction { steps }, None)
         .await?
         .into_committed()?;
      Ok(())
   }

   /// Execute multiple statements atomically, returning one result each.
   pub async fn execute_transaction(&self, statements: Vec<Statement>) -> Result<Vec<ExecuteResult>> {
      let scheduler = self.scheduler("execute_transaction")?;
      let steps = statements.into_iter().map(TransactionStep::from).collect();
      scheduler
         .submit(Operation::Transaction { steps }, None)
         .await?
         .into_committed()
   }

   /// The prepared statement for `sql`, preparing it on first use.
   ///
   /// Repeated calls with identical SQL return the same handle until the
   /// connection is closed.
   pub async fn get_statement(&self, sql: &str) -> Result<Arc<PreparedStatement>> {
      let scheduler = self.scheduler("get_statement")?;
      if let Some(statement) = self.cache.get(sql) {
         return Ok(statement);
      }

      let kind = OperationKind::Prepare {
         sql: sql.to_string(),
      };
      scheduler.submit(kind, None).await?.into_prepared()
   }

   /// Run a cached SELECT statement.
   pub async fn query_prepared(
      &self,
      statement: &Arc<PreparedStatement>,
      params: Vec<SqlValue>,
   ) -> Result<Vec<Row>> {
      let scheduler = self.scheduler("query_prepared")?;
      let kind = OperationKind::QueryPrepared {
         statement: Arc::clone(statement),
         params,
      };
      scheduler.submit(kind, None).await?.into_rows()
   }

   /// Run a cached write statement.
   pub async fn execute_prepared(
      &self,
      statement: &Arc<PreparedStatement>,
      params: Vec<SqlValue>,
   ) -> Result<ExecuteResult> {
      let scheduler = self.scheduler("execute_prepared")?;
      let kind = OperationKind::ExecutePrepared {
         statement: Arc::clone(statement),
         params,
      };
      scheduler.submit(kind, None).await?.into_executed()
   }

   /// Cheap liveness probe. Never fails; any problem (including a call from a
   /// non-owning process) reports `false`.
   pub async fn check_health(&self) -> bool {
      let scheduler = match self.scheduler("check_health") {
         Ok(scheduler) => scheduler,
         Err(e) => {
            debug!(error = %e, "Health check skipped");
            return false;
         }
      };

      let kind = OperationKind::Query {
         sql: HEALTH_CHECK_SQL.to_string(),
         params: Vec::new(),
      };
      match scheduler.submit(kind, None).await {
         Ok(_) => true,
         Err(e) => {
            warn!(error = %e, "Storage health check failed");
            false
         }
      }
   }

   /// Current pragma state and effective configuration.
   pub async fn diagnostics(&self) -> Result<Diagnostics> {
      let scheduler = self.scheduler("diagnostics")?;
      let engine = scheduler
         .submit(OperationKind::Diagnostics, None)
         .await?
         .into_diagnostics()?;

      Ok(Diagnostics::new(
         engine,
         &self.config,
         scheduler.queued(),
         self.cache.len(),
      ))
   }

   /// Number of operations waiting to run.
   pub fn queued_operations(&self) -> usize {
      self
         .scheduler
         .read()
         .as_ref()
         .map_or(0, |scheduler| scheduler.queued())
   }

   /// Emergency stop: reject every queued operation and abort the running
   /// one with [`Error::Aborted`]. The connection stays usable.
   ///
   /// Returns the number of queued operations that were rejected.
   pub fn abort_pending_operations(&self) -> Result<usize> {
      self.guard.check("abort_pending_operations")?;
      let scheduler = self.scheduler.read().clone();
      Ok(scheduler.map_or(0, |scheduler| scheduler.abort_pending()))
   }

   /// Finish queued work, flush and close the connection, and clear the
   /// statement cache. Idempotent.
   pub async fn close(&self) -> Result<()> {
      self.guard.check("close")?;
      let _lifecycle = self.lifecycle.lock().await;

      let Some(scheduler) = self.scheduler.write().take() else {
         return Ok(());
      };

      let result = scheduler.shutdown().await;
      self.cache.clear();
      debug!(path = %self.config.path.display(), "Storage closed");
      result
   }

   /// Delete every row from the data tables, keeping the schema.
   ///
   /// Only allowed when the manager was configured in test mode.
   #[cfg(any(test, feature = "test-util"))]
   pub async fn reset(&self) -> Result<()> {
      let scheduler = self.scheduler("reset")?;
      if !self.config.test_mode {
         return Err(Error::TestModeRequired("reset"));
      }

      let kind = Operation::Transaction {
         steps: schema::clear_statements(),
      };
      scheduler.submit(kind, None).await?.into_committed()?;
      debug!("Storage tables cleared");
      Ok(())
   }
}
