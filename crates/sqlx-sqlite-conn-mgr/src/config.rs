//! Configuration for the SQLite connection

use std::time::Duration;

/// Minimum busy timeout applied to every connection.
///
/// SQLite's busy handler waits this long for a competing lock before
/// reporting `SQLITE_BUSY`.
pub const MIN_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Pragma settings applied when the connection is opened
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_conn_mgr::SqliteConnectionConfig;
/// use std::time::Duration;
///
/// // Use defaults
/// let config = SqliteConnectionConfig::default();
///
/// // Override just one field
/// let config = SqliteConnectionConfig {
///     busy_timeout: Duration::from_secs(10),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteConnectionConfig {
   /// How long SQLite retries internally before reporting a busy/locked error.
   ///
   /// Values below [`MIN_BUSY_TIMEOUT`] are raised to it.
   ///
   /// Default: 5 seconds
   pub busy_timeout: Duration,

   /// Value for `PRAGMA cache_size`
   ///
   /// Negative values are a size in KiB, positive values a page count.
   ///
   /// Default: -16000 (about 16 MiB)
   pub cache_size: i64,

   /// Value for `PRAGMA page_size`
   ///
   /// Only takes effect when the database file is created.
   ///
   /// Default: 4096
   pub page_size: u32,

   /// Capacity of sqlx's per-connection prepared statement cache
   ///
   /// Default: 100
   pub statement_cache_capacity: usize,
}

impl SqliteConnectionConfig {
   /// Busy timeout after applying the lower bound.
   pub fn effective_busy_timeout(&self) -> Duration {
      self.busy_timeout.max(MIN_BUSY_TIMEOUT)
   }
}

impl Default for SqliteConnectionConfig {
   fn default() -> Self {
      Self {
         busy_timeout: MIN_BUSY_TIMEOUT,
         cache_size: -16_000,
         page_size: 4096,
         statement_cache_capacity: 100,
      }
   }
}
