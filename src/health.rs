//! Liveness probe and configuration report

use std::path::PathBuf;

use serde::Serialize;
use sqlx::SqliteConnection;

use crate::Result;
use crate::config::StorageConfig;
use crate::schema;

/// Trivial query used as the liveness probe.
pub(crate) const HEALTH_CHECK_SQL: &str = "SELECT 1";

/// Pragma values read from the live connection.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct EngineState {
   journal_mode: String,
   busy_timeout_ms: i64,
   foreign_keys: bool,
   cache_size: i64,
   page_size: i64,
   schema_version: Option<i64>,
}

pub(crate) async fn read_engine_state(conn: &mut SqliteConnection) -> Result<EngineState> {
   let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
      .fetch_one(&mut *conn)
      .await?;
   let busy_timeout_ms: i64 = sqlx::query_scalar("PRAGMA busy_timeout")
      .fetch_one(&mut *conn)
      .await?;
   let foreign_keys: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
      .fetch_one(&mut *conn)
      .await?;
   let cache_size: i64 = sqlx::query_scalar("PRAGMA cache_size")
      .fetch_one(&mut *conn)
      .await?;
   let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
      .fetch_one(&mut *conn)
      .await?;

   Ok(EngineState {
      journal_mode: journal_mode.to_lowercase(),
      busy_timeout_ms,
      foreign_keys: foreign_keys == 1,
      cache_size,
      page_size,
      schema_version: schema::read_version(conn).await?,
   })
}

/// Operational report: live pragma values plus the effective configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
   pub path: PathBuf,
   pub journal_mode: String,
   pub busy_timeout_ms: i64,
   pub foreign_keys: bool,
   pub cache_size: i64,
   pub page_size: i64,
   pub schema_version: Option<i64>,
   pub queued_operations: usize,
   pub cached_statements: usize,
   pub operation_timeout_ms: u128,
   pub queue_timeout_ms: u128,
   pub max_queue_depth: usize,
   pub retry_max_attempts: u32,
   pub test_mode: bool,
}

impl Diagnostics {
   pub(crate) fn new(
      engine: EngineState,
      config: &StorageConfig,
      queued_operations: usize,
      cached_statements: usize,
   ) -> Self {
      Self {
         path: config.path.clone(),
         journal_mode: engine.journal_mode,
         busy_timeout_ms: engine.busy_timeout_ms,
         foreign_keys: engine.foreign_keys,
         cache_size: engine.cache_size,
         page_size: engine.page_size,
         schema_version: engine.schema_version,
         queued_operations,
         cached_statements,
         operation_timeout_ms: config.operation_timeout.as_millis(),
         queue_timeout_ms: config.queue_timeout.as_millis(),
         max_queue_depth: config.max_queue_depth,
         retry_max_attempts: config.retry.max_attempts,
         test_mode: config.test_mode,
      }
   }

   pub fn is_wal(&self) -> bool {
      self.journal_mode == "wal"
   }
}
