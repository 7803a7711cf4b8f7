//! Storage configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx_sqlite_conn_mgr::{MIN_BUSY_TIMEOUT, SqliteConnectionConfig};

use crate::{Error, Result};

/// Operation budget applied in test mode.
const TEST_OPERATION_TIMEOUT: Duration = Duration::from_millis(5000);
/// Queue budget applied in test mode.
const TEST_QUEUE_TIMEOUT: Duration = Duration::from_millis(10_000);
const TEST_MAX_ATTEMPTS: u32 = 2;
const TEST_MAX_DELAY: Duration = Duration::from_millis(500);

/// Retry policy for busy/locked failures.
///
/// The delay before attempt `n + 1` is `base_delay * backoff_factor^(n - 1)`,
/// capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
   /// Total attempts including the first one
   pub max_attempts: u32,
   pub base_delay: Duration,
   pub max_delay: Duration,
   pub backoff_factor: f64,
}

impl RetryPolicy {
   /// Delay to wait after failed attempt number `attempt` (1-based).
   pub fn delay_for(&self, attempt: u32) -> Duration {
      let exponent = attempt.saturating_sub(1).min(32) as i32;
      let scaled = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
      if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
         return self.max_delay;
      }
      Duration::from_secs_f64(scaled)
   }
}

impl Default for RetryPolicy {
   fn default() -> Self {
      Self {
         max_attempts: 3,
         base_delay: Duration::from_millis(100),
         max_delay: Duration::from_millis(2000),
         backoff_factor: 2.0,
      }
   }
}

/// Configuration of a [`StorageManager`](crate::StorageManager).
///
/// Supplied once when the manager is created and never mutated afterwards.
///
/// # Examples
///
/// ```
/// use app_storage::StorageConfig;
/// use std::time::Duration;
///
/// let config = StorageConfig {
///     operation_timeout: Duration::from_secs(10),
///     ..StorageConfig::new("/tmp/app/storage.db")
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
   /// Database file; parent directories are created on initialize
   pub path: PathBuf,

   /// Budget for a running operation, including retries
   ///
   /// Default: 30 seconds
   pub operation_timeout: Duration,

   /// Budget for waiting in the queue before the operation starts
   ///
   /// Default: 60 seconds
   pub queue_timeout: Duration,

   /// Maximum number of operations waiting to run
   ///
   /// Default: 1024
   pub max_queue_depth: usize,

   pub retry: RetryPolicy,

   /// SQLite busy handler timeout; never below five seconds
   pub busy_timeout: Duration,

   /// `PRAGMA cache_size` (negative = KiB)
   pub cache_size: i64,

   /// `PRAGMA page_size`
   pub page_size: u32,

   /// Shortens timeouts and retry budgets and unlocks the reset hooks
   pub test_mode: bool,

   /// Name of the message channel other processes must use instead of
   /// calling the storage directly. Quoted in cross-process errors.
   pub ipc_channel: String,
}

impl StorageConfig {
   pub fn new(path: impl Into<PathBuf>) -> Self {
      let connection = SqliteConnectionConfig::default();
      Self {
         path: path.into(),
         operation_timeout: Duration::from_secs(30),
         queue_timeout: Duration::from_secs(60),
         max_queue_depth: 1024,
         retry: RetryPolicy::default(),
         busy_timeout: connection.busy_timeout,
         cache_size: connection.cache_size,
         page_size: connection.page_size,
         test_mode: false,
         ipc_channel: "storage:request".to_string(),
      }
   }

   /// Configuration with test mode enabled.
   pub fn for_tests(path: impl Into<PathBuf>) -> Self {
      Self {
         test_mode: true,
         ..Self::new(path)
      }
      .resolved()
   }

   pub fn path(&self) -> &Path {
      &self.path
   }

   /// The values actually used at runtime.
   ///
   /// In test mode the operation timeout, queue timeout, attempt count and
   /// maximum retry delay are capped so failing tests stop quickly. Smaller
   /// explicit values are kept.
   pub fn resolved(&self) -> Self {
      let mut config = self.clone();
      config.busy_timeout = config.busy_timeout.max(MIN_BUSY_TIMEOUT);
      if config.test_mode {
         config.operation_timeout = config.operation_timeout.min(TEST_OPERATION_TIMEOUT);
         config.queue_timeout = config.queue_timeout.min(TEST_QUEUE_TIMEOUT);
         config.retry.max_attempts = config.retry.max_attempts.min(TEST_MAX_ATTEMPTS);
         config.retry.max_delay = config.retry.max_delay.min(TEST_MAX_DELAY);
      }
      config
   }

   pub fn validate(&self) -> Result<()> {
      if self.path.as_os_str().is_empty() {
         return Err(Error::InvalidConfiguration("path must not be empty".into()));
      }
      if self.operation_timeout.is_zero() || self.queue_timeout.is_zero() {
         return Err(Error::InvalidConfiguration(
            "operation and queue timeouts must be greater than zero".into(),
         ));
      }
      if self.max_queue_depth == 0 {
         return Err(Error::InvalidConfiguration(
            "max_queue_depth must be greater than zero".into(),
         ));
      }
      if self.retry.max_attempts == 0 {
         return Err(Error::InvalidConfiguration(
            "retry.max_attempts must be at least 1".into(),
         ));
      }
      if !(self.retry.backoff_factor.is_finite() && self.retry.backoff_factor >= 1.0) {
         return Err(Error::InvalidConfiguration(
            "retry.backoff_factor must be a finite number >= 1".into(),
         ));
      }
      if !self.page_size.is_power_of_two() || !(512..=65536).contains(&self.page_size) {
         return Err(Error::InvalidConfiguration(format!(
            "page_size {} must be a power of two between 512 and 65536",
            self.page_size
         )));
      }
      Ok(())
   }

   pub(crate) fn connection_config(&self) -> SqliteConnectionConfig {
      SqliteConnectionConfig {
         busy_timeout: self.busy_timeout,
         cache_size: self.cache_size,
         page_size: self.page_size,
         ..Default::default()
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_defaults_are_valid() {
      let config = StorageConfig::new("/tmp/app.db");
      assert!(config.validate().is_ok());
      assert!(!config.test_mode);
      assert_eq!(config.resolved(), config);
   }

   #[test]
   fn test_test_mode_caps_budgets() {
      let config = StorageConfig::for_tests("/tmp/app.db");

      assert!(config.test_mode);
      assert_eq!(config.operation_timeout, Duration::from_millis(5000));
      assert_eq!(config.queue_timeout, Duration::from_millis(10_000));
      assert_eq!(config.retry.max_attempts, 2);
      assert_eq!(config.retry.max_delay, Duration::from_millis(500));
   }

   #[test]
   fn test_test_mode_keeps_smaller_values() {
      let config = StorageConfig {
         queue_timeout: Duration::from_millis(100),
         ..StorageConfig::for_tests("/tmp/app.db")
      }
      .resolved();

      assert_eq!(config.queue_timeout, Duration::from_millis(100));
   }

   #[test]
   fn test_busy_timeout_floor() {
      let config = StorageConfig {
         busy_timeout: Duration::from_millis(1),
         ..StorageConfig::new("/tmp/app.db")
      }
      .resolved();

      assert_eq!(config.busy_timeout, Duration::from_millis(5000));
   }

   #[test]
   fn test_validate_rejects_bad_values() {
      let base = StorageConfig::new("/tmp/app.db");

      let err = StorageConfig {
         path: PathBuf::new(),
         ..base.clone()
      }
      .validate()
      .unwrap_err();
      assert_eq!(err.error_code(), "INVALID_CONFIGURATION");

      assert!(
         StorageConfig {
            page_size: 3000,
            ..base.clone()
         }
         .validate()
         .is_err()
      );

      assert!(
         StorageConfig {
            max_queue_depth: 0,
            ..base.clone()
         }
         .validate()
         .is_err()
      );

      let mut retry = RetryPolicy::default();
      retry.backoff_factor = 0.5;
      assert!(StorageConfig { retry, ..base }.validate().is_err());
   }

   #[test]
   fn test_retry_delays_grow_and_cap() {
      let policy = RetryPolicy {
         max_attempts: 5,
         base_delay: Duration::from_millis(100),
         max_delay: Duration::from_millis(300),
         backoff_factor: 2.0,
      };

      assert_eq!(policy.delay_for(1), Duration::from_millis(100));
      assert_eq!(policy.delay_for(2), Duration::from_millis(200));
      assert_eq!(policy.delay_for(3), Duration::from_millis(300));
      assert_eq!(policy.delay_for(10), Duration::from_millis(300));
   }
}
