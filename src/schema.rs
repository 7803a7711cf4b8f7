//! Schema bootstrap for the application tables
//!
//! Every statement is `IF NOT EXISTS`, so bootstrapping an existing database
//! is a no-op apart from reading the version marker.

use sqlx::SqliteConnection;
use tracing::debug;

use crate::Result;
use crate::config::RetryPolicy;
use crate::transactions::{self, Statement, TransactionStep};
use crate::value::SqlValue;

/// Version recorded in `schema_version` on first bootstrap.
pub const SCHEMA_VERSION: i64 = 1;

/// Tables holding application data, in an order that is safe to clear
/// (children before parents).
pub const DATA_TABLES: [&str; 5] = [
   "bookmarks",
   "bookmark_folders",
   "tab_groups",
   "sessions",
   "settings",
];

/// Every table the bootstrapper creates.
pub const TABLES: [&str; 6] = [
   "sessions",
   "tab_groups",
   "bookmark_folders",
   "bookmarks",
   "settings",
   "schema_version",
];

/// Every index the bootstrapper creates.
pub const INDICES: [&str; 7] = [
   "idx_sessions_timestamp",
   "idx_tab_groups_session",
   "idx_tab_groups_updated",
   "idx_bookmark_folders_parent",
   "idx_bookmarks_folder",
   "idx_bookmarks_url",
   "idx_settings_updated",
];

const DDL: [&str; 13] = [
   // Timestamps are epoch milliseconds; tabs/tags hold JSON arrays as text
   r#"
   CREATE TABLE IF NOT EXISTS sessions (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      tabs TEXT NOT NULL DEFAULT '[]',
      window_state TEXT,
      timestamp INTEGER NOT NULL,
      version TEXT NOT NULL
   )
   "#,
   "CREATE INDEX IF NOT EXISTS idx_sessions_timestamp ON sessions(timestamp DESC)",
   r#"
   CREATE TABLE IF NOT EXISTS tab_groups (
      id TEXT PRIMARY KEY,
      session_id INTEGER REFERENCES sessions(id) ON DELETE CASCADE,
      name TEXT NOT NULL,
      color TEXT,
      collapsed INTEGER NOT NULL DEFAULT 0,
      tabs TEXT NOT NULL DEFAULT '[]',
      created_at INTEGER NOT NULL,
      updated_at INTEGER NOT NULL
   )
   "#,
   "CREATE INDEX IF NOT EXISTS idx_tab_groups_session ON tab_groups(session_id)",
   "CREATE INDEX IF NOT EXISTS idx_tab_groups_updated ON tab_groups(updated_at DESC)",
   r#"
   CREATE TABLE IF NOT EXISTS bookmark_folders (
      id TEXT PRIMARY KEY,
      parent_id TEXT REFERENCES bookmark_folders(id) ON DELETE CASCADE,
      name TEXT NOT NULL,
      position INTEGER NOT NULL DEFAULT 0,
      created_at INTEGER NOT NULL,
      updated_at INTEGER NOT NULL
   )
   "#,
   "CREATE INDEX IF NOT EXISTS idx_bookmark_folders_parent ON bookmark_folders(parent_id, position)",
   r#"
   CREATE TABLE IF NOT EXISTS bookmarks (
      id TEXT PRIMARY KEY,
      folder_id TEXT REFERENCES bookmark_folders(id) ON DELETE SET NULL,
      url TEXT NOT NULL,
      title TEXT NOT NULL DEFAULT '',
      favicon TEXT,
      tags TEXT NOT NULL DEFAULT '[]',
      position INTEGER NOT NULL DEFAULT 0,
      created_at INTEGER NOT NULL,
      updated_at INTEGER NOT NULL
   )
   "#,
   "CREATE INDEX IF NOT EXISTS idx_bookmarks_folder ON bookmarks(folder_id, position)",
   "CREATE INDEX IF NOT EXISTS idx_bookmarks_url ON bookmarks(url)",
   r#"
   CREATE TABLE IF NOT EXISTS settings (
      key TEXT PRIMARY KEY,
      value TEXT NOT NULL,
      updated_at INTEGER NOT NULL
   )
   "#,
   "CREATE INDEX IF NOT EXISTS idx_settings_updated ON settings(updated_at DESC)",
   r#"
   CREATE TABLE IF NOT EXISTS schema_version (
      version INTEGER NOT NULL,
      applied_at INTEGER NOT NULL
   )
   "#,
];

/// Create missing tables and indices and record the schema version once.
///
/// Runs as a single immediate transaction.
pub(crate) async fn bootstrap(conn: &mut SqliteConnection, retry: &RetryPolicy) -> Result<i64> {
   let mut steps: Vec<TransactionStep> = DDL.iter().map(|sql| Statement::new(*sql).into()).collect();

   steps.push(
      Statement::with_params(
         "INSERT INTO schema_version (version, applied_at) SELECT ?, ? WHERE NOT EXISTS (SELECT 1 FROM schema_version)",
         vec![SqlValue::Integer(SCHEMA_VERSION), SqlValue::Integer(now_millis())],
      )
      .into(),
   );

   transactions::run(conn, steps, retry).await?;

   let version = read_version(conn).await?.unwrap_or(SCHEMA_VERSION);
   debug!(version, "Schema bootstrap complete");
   Ok(version)
}

/// The recorded schema version, if the marker table has a row.
pub(crate) async fn read_version(conn: &mut SqliteConnection) -> Result<Option<i64>> {
   let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
      .fetch_one(&mut *conn)
      .await?;
   Ok(version)
}

/// Statements that empty every data table and restart AUTOINCREMENT
/// counters. The schema and its version marker are kept.
pub(crate) fn clear_statements() -> Vec<TransactionStep> {
   let mut steps: Vec<TransactionStep> = DATA_TABLES
      .iter()
      .map(|table| Statement::new(format!("DELETE FROM {table}")).into())
      .collect();

   steps.push(Statement::new("DELETE FROM sqlite_sequence").into());
   steps
}

/// Current time as epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
   (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
   use super::*;
   use sqlx::Connection;

   async fn memory_conn() -> SqliteConnection {
      SqliteConnection::connect("sqlite::memory:").await.unwrap()
   }

   async fn object_names(conn: &mut SqliteConnection, kind: &str) -> Vec<String> {
      sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = ? AND name NOT LIKE 'sqlite_%'")
         .bind(kind)
         .fetch_all(conn)
         .await
         .unwrap()
   }

   #[tokio::test]
   async fn test_bootstrap_creates_tables_and_indices() {
      let mut conn = memory_conn().await;

      let version = bootstrap(&mut conn, &RetryPolicy::default()).await.unwrap();
      assert_eq!(version, SCHEMA_VERSION);

      let tables = object_names(&mut conn, "table").await;
      for table in TABLES {
         assert!(tables.iter().any(|t| t == table), "missing table {table}");
      }

      let indices = object_names(&mut conn, "index").await;
      for index in INDICES {
         assert!(indices.iter().any(|i| i == index), "missing index {index}");
      }
   }

   #[tokio::test]
   async fn test_bootstrap_is_idempotent() {
      let mut conn = memory_conn().await;
      let retry = RetryPolicy::default();

      bootstrap(&mut conn, &retry).await.unwrap();
      bootstrap(&mut conn, &retry).await.unwrap();
      bootstrap(&mut conn, &retry).await.unwrap();

      let markers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_version")
         .fetch_one(&mut conn)
         .await
         .unwrap();
      assert_eq!(markers, 1);
   }

   #[tokio::test]
   async fn test_clear_keeps_schema_and_version() {
      let mut conn = memory_conn().await;
      let retry = RetryPolicy::default();
      bootstrap(&mut conn, &retry).await.unwrap();

      sqlx::query("INSERT INTO sessions (tabs, timestamp, version) VALUES ('[]', 1, '1.0')")
         .execute(&mut conn)
         .await
         .unwrap();
      sqlx::query("INSERT INTO settings (key, value, updated_at) VALUES ('theme', 'dark', 1)")
         .execute(&mut conn)
         .await
         .unwrap();

      transactions::run(&mut conn, clear_statements(), &retry)
         .await
         .unwrap();

      for table in DATA_TABLES {
         let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&mut conn)
            .await
            .unwrap();
         assert_eq!(count, 0, "{table} not cleared");
      }

      assert_eq!(read_version(&mut conn).await.unwrap(), Some(SCHEMA_VERSION));

      // AUTOINCREMENT restarts after a clear
      let id = sqlx::query("INSERT INTO sessions (tabs, timestamp, version) VALUES ('[]', 2, '1.0')")
         .execute(&mut conn)
         .await
         .unwrap()
         .last_insert_rowid();
      assert_eq!(id, 1);
   }
}
