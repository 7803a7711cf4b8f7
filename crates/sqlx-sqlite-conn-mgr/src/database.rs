//! The single physical SQLite connection and its lifecycle

use std::path::{Path, PathBuf};

use log::LevelFilter;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection};
use tracing::{debug, warn};

use crate::config::SqliteConnectionConfig;
use crate::error::{Error, Result};
use crate::interrupt::{ArmedInterrupt, InterruptHandle};

/// Owner of the one read-write connection to a database file.
///
/// ## Pragma policy
///
/// Opening applies, in order:
/// - `page_size` (only effective for a new file)
/// - `journal_mode = WAL`, verified after connect
/// - `foreign_keys = ON`, verified after connect
/// - `synchronous = NORMAL`
/// - `cache_size`
/// - busy timeout of at least five seconds
///
/// ## Ownership
///
/// Whoever holds the `SqliteDatabase` is the only code allowed to run
/// statements on it. Other tasks that need to stop a runaway statement use the
/// [`InterruptHandle`], which is disarmed on [`close`](Self::close) or when
/// the database is dropped.
#[derive(Debug)]
pub struct SqliteDatabase {
   /// Interrupts the running statement from another task. Declared before
   /// `conn` so it is disarmed before the connection is dropped.
   interrupt: ArmedInterrupt,

   conn: SqliteConnection,

   /// Path to database file
   path: PathBuf,
}

impl SqliteDatabase {
   /// Open (creating if needed) the database at `path`.
   ///
   /// Missing parent directories are created first.
   pub async fn open(path: impl AsRef<Path>, config: &SqliteConnectionConfig) -> Result<Self> {
      let path = path.as_ref().to_path_buf();

      if let Some(parent) = path.parent()
         && !parent.as_os_str().is_empty()
      {
         tokio::fs::create_dir_all(parent).await?;
      }

      let options = SqliteConnectOptions::new()
         .filename(&path)
         .create_if_missing(true)
         .page_size(config.page_size)
         .journal_mode(SqliteJournalMode::Wal)
         .foreign_keys(true)
         .synchronous(SqliteSynchronous::Normal)
         .pragma("cache_size", config.cache_size.to_string())
         .busy_timeout(config.effective_busy_timeout())
         .statement_cache_capacity(config.statement_cache_capacity)
         .log_statements(LevelFilter::Trace);

      let mut conn = options.connect().await?;

      verify_pragma(&mut conn, "journal_mode", "wal").await?;
      verify_pragma(&mut conn, "foreign_keys", "1").await?;

      let raw = {
         let mut handle = conn.lock_handle().await?;
         handle.as_raw_handle()
      };

      debug!(path = %path.display(), "Opened SQLite database in WAL mode");

      Ok(Self {
         interrupt: ArmedInterrupt::new(raw),
         conn,
         path,
      })
   }

   /// Mutable access to the connection for the owner of this database.
   pub fn connection(&mut self) -> &mut SqliteConnection {
      &mut self.conn
   }

   /// Handle for interrupting the running statement from another task
   pub fn interrupt_handle(&self) -> InterruptHandle {
      self.interrupt.handle()
   }

   /// Path to the database file
   pub fn path(&self) -> &Path {
      &self.path
   }

   /// Flush the write-ahead log into the main file and close the connection.
   ///
   /// A failed checkpoint is logged and does not prevent the close.
   pub async fn close(mut self) -> Result<()> {
      self.interrupt.disarm();

      if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
         .execute(&mut self.conn)
         .await
      {
         warn!(path = %self.path.display(), error = %e, "WAL checkpoint before close failed");
      }

      self.conn.close().await?;
      debug!("Closed SQLite database: {}", self.path.display());
      Ok(())
   }
}

/// Read a pragma back and compare it (case-insensitively) with what was requested.
async fn verify_pragma(
   conn: &mut SqliteConnection,
   pragma: &'static str,
   expected: &str,
) -> Result<()> {
   let sql = format!("SELECT CAST({pragma} AS TEXT) FROM pragma_{pragma}");
   let actual: String = sqlx::query_scalar(&sql).fetch_one(&mut *conn).await?;

   if !actual.eq_ignore_ascii_case(expected) {
      return Err(Error::PragmaMismatch {
         pragma,
         expected: expected.to_string(),
         actual,
      });
   }

   Ok(())
}

#[cfg(test)]
mod tests {
   use super::*;
   use tempfile::TempDir;

   #[tokio::test]
   async fn test_open_creates_missing_directories() {
      let temp = TempDir::new().unwrap();
      let path = temp.path().join("nested").join("dir").join("app.db");

      let db = SqliteDatabase::open(&path, &SqliteConnectionConfig::default())
         .await
         .unwrap();

      assert!(path.exists());
      assert_eq!(db.path(), path.as_path());
      db.close().await.unwrap();
   }

   #[tokio::test]
   async fn test_open_applies_pragmas() {
      let temp = TempDir::new().unwrap();
      let config = SqliteConnectionConfig {
         cache_size: -4000,
         ..Default::default()
      };
      let mut db = SqliteDatabase::open(temp.path().join("app.db"), &config)
         .await
         .unwrap();

      let conn = db.connection();

      let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
         .fetch_one(&mut *conn)
         .await
         .unwrap();
      assert_eq!(mode.to_lowercase(), "wal");

      let fk: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
         .fetch_one(&mut *conn)
         .await
         .unwrap();
      assert_eq!(fk, 1);

      let busy: i64 = sqlx::query_scalar("PRAGMA busy_timeout")
         .fetch_one(&mut *conn)
         .await
         .unwrap();
      assert!(busy >= 5000);

      let cache: i64 = sqlx::query_scalar("PRAGMA cache_size")
         .fetch_one(&mut *conn)
         .await
         .unwrap();
      assert_eq!(cache, -4000);

      db.close().await.unwrap();
   }

   #[tokio::test]
   async fn test_close_disarms_interrupt_handle() {
      let temp = TempDir::new().unwrap();
      let db = SqliteDatabase::open(temp.path().join("app.db"), &SqliteConnectionConfig::default())
         .await
         .unwrap();

      let handle = db.interrupt_handle();
      assert!(handle.is_armed());

      // Nothing is running, so this is a no-op for SQLite
      assert!(handle.interrupt());

      db.close().await.unwrap();

      assert!(!handle.is_armed());
      assert!(!handle.interrupt());
   }

   #[tokio::test]
   async fn test_drop_without_close_disarms_interrupt_handle() {
      let temp = TempDir::new().unwrap();
      let db = SqliteDatabase::open(temp.path().join("app.db"), &SqliteConnectionConfig::default())
         .await
         .unwrap();

      let handle = db.interrupt_handle();
      let other = handle.clone();
      drop(db);

      assert!(!handle.is_armed());
      assert!(!other.is_armed());
      assert!(!other.interrupt());
   }

   #[tokio::test]
   async fn test_connection_usable_after_idle_interrupt() {
      let temp = TempDir::new().unwrap();
      let mut db =
         SqliteDatabase::open(temp.path().join("app.db"), &SqliteConnectionConfig::default())
            .await
            .unwrap();

      db.interrupt_handle().interrupt();

      let one: i64 = sqlx::query_scalar("SELECT 1")
         .fetch_one(db.connection())
         .await
         .unwrap();
      assert_eq!(one, 1);

      db.close().await.unwrap();
   }
}
