//! Identity-stable prepared statements keyed by SQL text

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use sqlx::sqlite::SqliteStatement;
use sqlx::{Column, Statement};

use crate::{Error, Result};

/// A statement prepared on the current connection.
///
/// Handles are shared: asking for the same SQL again while the connection is
/// open returns the same `Arc`, so `Arc::ptr_eq` holds between them.
pub struct PreparedStatement {
   sql: String,
   /// Connection lifetime the statement was prepared in
   generation: u64,
   inner: SqliteStatement<'static>,
}

impl PreparedStatement {
   pub fn sql(&self) -> &str {
      &self.sql
   }

   /// Names of the result columns, in order. Empty for statements that
   /// return no rows.
   pub fn column_names(&self) -> Vec<&str> {
      self.inner.columns().iter().map(|c| c.name()).collect()
   }

   pub(crate) fn inner(&self) -> &SqliteStatement<'static> {
      &self.inner
   }
}

impl fmt::Debug for PreparedStatement {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("PreparedStatement")
         .field("sql", &self.sql)
         .field("generation", &self.generation)
         .finish()
   }
}

/// Cache of prepared statements for one connection lifetime.
///
/// No eviction: the set of SQL templates issued by the stores is finite.
#[derive(Default)]
pub(crate) struct StatementCache {
   entries: Mutex<HashMap<String, Arc<PreparedStatement>>>,
   generation: AtomicU64,
}

impl StatementCache {
   pub(crate) fn get(&self, sql: &str) -> Option<Arc<PreparedStatement>> {
      self.entries.lock().get(sql).cloned()
   }

   /// Store a freshly prepared statement. If one is already cached for the
   /// same SQL, that one is kept and returned.
   pub(crate) fn insert(
      &self,
      sql: &str,
      statement: SqliteStatement<'static>,
   ) -> Arc<PreparedStatement> {
      let generation = self.generation.load(Ordering::Acquire);
      let mut entries = self.entries.lock();
      Arc::clone(entries.entry(sql.to_string()).or_insert_with(|| {
         Arc::new(PreparedStatement {
            sql: sql.to_string(),
            generation,
            inner: statement,
         })
      }))
   }

   /// Drop every entry and invalidate handles still held by callers.
   pub(crate) fn clear(&self) {
      let mut entries = self.entries.lock();
      entries.clear();
      self.generation.fetch_add(1, Ordering::AcqRel);
   }

   pub(crate) fn len(&self) -> usize {
      self.entries.lock().len()
   }

   pub(crate) fn ensure_current(&self, statement: &PreparedStatement) -> Result<()> {
      if statement.generation != self.generation.load(Ordering::Acquire) {
         return Err(Error::StaleStatement(statement.sql.clone()));
      }
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use sqlx::{Connection, Executor, SqliteConnection};

   async fn prepare(conn: &mut SqliteConnection, sql: &str) -> SqliteStatement<'static> {
      let statement = (&mut *conn).prepare(sql).await.unwrap();
      sqlx::Statement::to_owned(&statement)
   }

   #[tokio::test]
   async fn test_same_sql_returns_same_handle() {
      let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
      let cache = StatementCache::default();
      let sql = "SELECT 1 AS one";

      let first = cache.insert(sql, prepare(&mut conn, sql).await);
      // A second prepare for the same SQL does not replace the cached handle
      let second = cache.insert(sql, prepare(&mut conn, sql).await);
      let looked_up = cache.get(sql).unwrap();

      assert!(Arc::ptr_eq(&first, &second));
      assert!(Arc::ptr_eq(&first, &looked_up));
      assert_eq!(first.column_names(), vec!["one"]);
      assert_eq!(cache.len(), 1);
   }

   #[tokio::test]
   async fn test_clear_invalidates_handles() {
      let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
      let cache = StatementCache::default();
      let sql = "SELECT 2";

      let handle = cache.insert(sql, prepare(&mut conn, sql).await);
      assert!(cache.ensure_current(&handle).is_ok());

      cache.clear();

      assert_eq!(cache.len(), 0);
      assert!(cache.get(sql).is_none());
      let err = cache.ensure_current(&handle).unwrap_err();
      assert_eq!(err.error_code(), "STALE_STATEMENT");

      let fresh = cache.insert(sql, prepare(&mut conn, sql).await);
      assert!(!Arc::ptr_eq(&handle, &fresh));
      assert!(cache.ensure_current(&fresh).is_ok());
   }
}
