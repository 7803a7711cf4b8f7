//! Retry of busy/locked failures

use sqlx::SqliteConnection;
use tracing::warn;

use super::operation::{OperationKind, OperationOutput, run_attempt};
use crate::config::RetryPolicy;
use crate::statement_cache::StatementCache;
use crate::{Error, Result};

/// Wait out the backoff delay if `err` deserves another attempt.
///
/// Returns `false` straight away for non-transient errors and when
/// `attempt` (1-based) was the last one allowed.
pub(crate) async fn backoff(policy: &RetryPolicy, attempt: u32, err: &Error) -> bool {
   if !err.is_transient() || attempt >= policy.max_attempts {
      return false;
   }

   let delay = policy.delay_for(attempt);
   warn!(
      "SQLite contention on attempt {}/{}, retrying in {:?}",
      attempt, policy.max_attempts, delay
   );
   tokio::time::sleep(delay).await;
   true
}

/// Run `kind`, retrying in place while it fails with busy/locked errors.
pub(crate) async fn with_retry(
   conn: &mut SqliteConnection,
   kind: &OperationKind,
   cache: &StatementCache,
   policy: &RetryPolicy,
) -> Result<OperationOutput> {
   let mut attempt = 1;
   loop {
      match run_attempt(conn, kind, cache).await {
         Ok(output) => return Ok(output),
         Err(e) => {
            if !backoff(policy, attempt, &e).await {
               return Err(e);
            }
            attempt += 1;
         }
      }
   }
}
