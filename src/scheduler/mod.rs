//! Operation scheduler
//!
//! Every query, execute, statement preparation and transaction is queued here
//! and run one at a time by a dispatcher task that exclusively owns the
//! connection.
//!
//! ## Deadlines
//!
//! - **Queue deadline**: `enqueued_at + queue_timeout`, enforced by the caller
//!   (which withdraws its own operation from the queue) and re-checked by the
//!   dispatcher when it dequeues.
//! - **Run deadline**: `started_at + timeout`, enforced by the dispatcher
//!   around the whole run including retries. On expiry the engine call is
//!   interrupted and abandoned.
//!
//! ## Abort
//!
//! `abort_pending` drains the queue and bumps the abort epoch under the queue
//! lock. The dispatcher records the epoch when it dequeues, so an operation
//! taken just before the abort still observes it.

pub(crate) mod operation;
pub(crate) mod retry;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use sqlx::SqliteConnection;
use sqlx_sqlite_conn_mgr::{InterruptHandle, SqliteDatabase};
use tokio::sync::{Notify, Semaphore, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::{RetryPolicy, StorageConfig};
use crate::statement_cache::StatementCache;
use crate::transactions;
use crate::{Error, Result};

use operation::{Operation, OperationOutput, OperationState, PendingOperation};

tokio::task_local! {
   /// Set while the dispatcher runs an operation, so calls made from inside a
   /// transaction step can be detected instead of deadlocking.
   static DISPATCHING: ();
}

/// Limits the scheduler enforces.
#[derive(Debug, Clone)]
pub(crate) struct SchedulerPolicy {
   pub(crate) operation_timeout: Duration,
   pub(crate) queue_timeout: Duration,
   pub(crate) max_queue_depth: usize,
   pub(crate) retry: RetryPolicy,
}

impl From<&StorageConfig> for SchedulerPolicy {
   fn from(config: &StorageConfig) -> Self {
      Self {
         operation_timeout: config.operation_timeout,
         queue_timeout: config.queue_timeout,
         max_queue_depth: config.max_queue_depth,
         retry: config.retry.clone(),
      }
   }
}

#[derive(Default)]
struct QueueState {
   pending: VecDeque<PendingOperation>,
   running: Option<u64>,
   abort_epoch: u64,
   closed: bool,
}

struct Shared {
   queue: Mutex<QueueState>,
   /// Wakes the dispatcher when work arrives or the queue closes
   wake: Notify,
   /// One permit per queue slot
   slots: Arc<Semaphore>,
   abort_tx: watch::Sender<u64>,
   next_id: AtomicU64,
   policy: SchedulerPolicy,
   interrupt: InterruptHandle,
   cache: Arc<StatementCache>,
}

impl Shared {
   fn close_queue(&self) {
      self.queue.lock().closed = true;
      self.slots.close();
      self.wake.notify_one();
   }

   /// Remove a still-queued operation. `false` once the dispatcher has it.
   fn withdraw(&self, id: u64) -> bool {
      let mut queue = self.queue.lock();
      match queue.pending.iter().position(|op| op.id == id) {
         Some(index) => {
            queue.pending.remove(index);
            true
         }
         None => false,
      }
   }
}

/// Handle to the dispatcher task and its queue.
///
/// Dropping the scheduler closes the queue; the dispatcher finishes what is
/// already queued and drops the connection.
pub(crate) struct Scheduler {
   shared: Arc<Shared>,
   dispatcher: Mutex<Option<JoinHandle<SqliteDatabase>>>,
}

impl Scheduler {
   /// Hand `db` to a new dispatcher task.
   pub(crate) fn start(
      db: SqliteDatabase,
      policy: SchedulerPolicy,
      cache: Arc<StatementCache>,
   ) -> Self {
      let (abort_tx, _) = watch::channel(0);
      let shared = Arc::new(Shared {
         queue: Mutex::new(QueueState::default()),
         wake: Notify::new(),
         slots: Arc::new(Semaphore::new(policy.max_queue_depth)),
         abort_tx,
         next_id: AtomicU64::new(1),
         interrupt: db.interrupt_handle(),
         policy,
         cache,
      });

      let dispatcher = tokio::spawn(dispatch(Arc::clone(&shared), db));

      Self {
         shared,
         dispatcher: Mutex::new(Some(dispatcher)),
      }
   }

   /// Queue `operation` and wait for its outcome.
   ///
   /// `timeout` overrides the configured operation timeout for this call.
   pub(crate) async fn submit(
      &self,
      operation: impl Into<Operation>,
      timeout: Option<Duration>,
   ) -> Result<OperationOutput> {
      let operation = operation.into();
      if DISPATCHING.try_with(|_| ()).is_ok() {
         return Err(Error::NestedOperation(operation.label()));
      }

      let policy = &self.shared.policy;
      let enqueued_at = Instant::now();
      let queue_deadline = enqueued_at + policy.queue_timeout;
      let queue_timeout = || Error::QueueTimeout {
         waited: enqueued_at.elapsed(),
         limit: policy.queue_timeout,
      };

      let slot = match tokio::time::timeout_at(
         queue_deadline,
         Arc::clone(&self.shared.slots).acquire_owned(),
      )
      .await
      {
         Ok(Ok(slot)) => slot,
         Ok(Err(_)) => return Err(Error::Closed),
         Err(_) => {
            warn!(operation = operation.label(), "Queue full past the queue timeout");
            return Err(queue_timeout());
         }
      };

      let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
      let label = operation.label();
      let (reply, mut rx) = oneshot::channel();

      {
         let mut queue = self.shared.queue.lock();
         if queue.closed {
            return Err(Error::Closed);
         }
         queue.pending.push_back(PendingOperation {
            id,
            operation,
            timeout: timeout.unwrap_or(policy.operation_timeout),
            enqueued_at,
            reply,
            _slot: slot,
         });
      }
      trace!(id, operation = label, state = ?OperationState::Queued, "Operation queued");
      self.shared.wake.notify_one();

      tokio::select! {
         outcome = &mut rx => return flatten(outcome),
         _ = tokio::time::sleep_until(queue_deadline) => {}
      }

      if self.shared.withdraw(id) {
         warn!(id, operation = label, "Operation timed out in the queue");
         return Err(queue_timeout());
      }

      // Already running; its own deadline applies from here
      flatten(rx.await)
   }

   /// Reject everything queued and abort the running operation.
   ///
   /// Returns how many queued operations were rejected.
   pub(crate) fn abort_pending(&self) -> usize {
      let (drained, running) = {
         let mut queue = self.shared.queue.lock();
         let drained: Vec<PendingOperation> = queue.pending.drain(..).collect();
         queue.abort_epoch += 1;
         self.shared.abort_tx.send_replace(queue.abort_epoch);
         (drained, queue.running)
      };

      debug!(
         queued = drained.len(),
         running = ?running,
         "Aborting pending storage operations"
      );

      let count = drained.len();
      for op in drained {
         trace!(id = op.id, state = ?OperationState::Aborted, "Operation aborted while queued");
         let _ = op.reply.send(Err(Error::Aborted));
      }
      count
   }

   pub(crate) fn queued(&self) -> usize {
      self.shared.queue.lock().pending.len()
   }

   /// Stop accepting work, let the dispatcher drain the queue, then close
   /// the connection.
   pub(crate) async fn shutdown(&self) -> Result<()> {
      self.shared.close_queue();

      let Some(dispatcher) = self.dispatcher.lock().take() else {
         return Ok(());
      };

      let db = dispatcher
         .await
         .map_err(|e| Error::Other(format!("storage dispatcher failed: {e}")))?;
      db.close().await?;
      Ok(())
   }
}

impl Drop for Scheduler {
   fn drop(&mut self) {
      self.shared.close_queue();
   }
}

fn flatten(
   outcome: std::result::Result<Result<OperationOutput>, oneshot::error::RecvError>,
) -> Result<OperationOutput> {
   // The dispatcher replies exactly once unless it died mid-operation
   outcome.unwrap_or(Err(Error::Aborted))
}

enum Next {
   Run(PendingOperation, u64),
   Idle,
   Stop,
}

enum Outcome {
   Finished(Result<OperationOutput>),
   TimedOut,
   Aborted,
}

async fn dispatch(shared: Arc<Shared>, mut db: SqliteDatabase) -> SqliteDatabase {
   let mut abort_rx = shared.abort_tx.subscribe();
   debug!(path = %db.path().display(), "Storage dispatcher started");

   loop {
      let next = {
         let mut queue = shared.queue.lock();
         match queue.pending.pop_front() {
            Some(op) => {
               queue.running = Some(op.id);
               Next::Run(op, queue.abort_epoch)
            }
            None if queue.closed => Next::Stop,
            None => Next::Idle,
         }
      };

      match next {
         Next::Run(op, epoch) => {
            run_one(&shared, &mut db, op, epoch, &mut abort_rx).await;
            shared.queue.lock().running = None;
         }
         Next::Idle => shared.wake.notified().await,
         Next::Stop => break,
      }
   }

   debug!("Storage dispatcher stopped");
   db
}

async fn run_one(
   shared: &Shared,
   db: &mut SqliteDatabase,
   op: PendingOperation,
   epoch: u64,
   abort_rx: &mut watch::Receiver<u64>,
) {
   let PendingOperation {
      id,
      operation,
      timeout,
      enqueued_at,
      reply,
      _slot,
   } = op;

   let waited = enqueued_at.elapsed();
   if waited > shared.policy.queue_timeout {
      let _ = reply.send(Err(Error::QueueTimeout {
         waited,
         limit: shared.policy.queue_timeout,
      }));
      return;
   }

   let label = operation.label();
   let is_transaction = operation.is_transaction();
   let deadline = Instant::now() + timeout;
   trace!(id, operation = label, state = ?OperationState::Running, ?waited, "Operation started");

   let outcome = {
      let work = DISPATCHING.scope(
         (),
         execute(db.connection(), operation, &shared.policy.retry, &shared.cache),
      );

      tokio::select! {
         result = work => Outcome::Finished(result),
         _ = tokio::time::sleep_until(deadline) => Outcome::TimedOut,
         _ = abort_rx.wait_for(|current| *current != epoch) => Outcome::Aborted,
      }
   };

   let result = match outcome {
      Outcome::Finished(result) => result,
      Outcome::TimedOut => {
         warn!(id, operation = label, ?timeout, "Operation timed out; outcome unknown");
         abandon(shared, db, is_transaction).await;
         Err(Error::Timeout(timeout))
      }
      Outcome::Aborted => {
         warn!(id, operation = label, "Running operation aborted");
         abandon(shared, db, is_transaction).await;
         Err(Error::Aborted)
      }
   };

   trace!(id, operation = label, state = ?OperationState::of(&result), "Operation finished");
   if reply.send(result).is_err() {
      debug!(id, operation = label, "Caller stopped waiting before the outcome was delivered");
   }
}

async fn execute(
   conn: &mut SqliteConnection,
   operation: Operation,
   policy: &RetryPolicy,
   cache: &StatementCache,
) -> Result<OperationOutput> {
   match operation {
      Operation::Transaction { steps } => transactions::run(conn, steps, policy)
         .await
         .map(OperationOutput::Committed),
      Operation::Single(kind) => retry::with_retry(conn, &kind, cache, policy).await,
   }
}

/// Stop the engine call that was left behind and undo a half-done transaction.
async fn abandon(shared: &Shared, db: &mut SqliteDatabase, is_transaction: bool) {
   shared.interrupt.interrupt();
   if is_transaction {
      transactions::rollback_quietly(db.connection()).await;
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::cell::Cell;

   use sqlx_sqlite_conn_mgr::SqliteConnectionConfig;
   use tempfile::TempDir;

   use crate::transactions::TransactionStep;
   use super::operation::OperationKind;

   fn assert_send<T: Send>(_: &T) {}

   async fn start(temp: &TempDir) -> Scheduler {
      let path = temp.path().join("app.db");
      let db = SqliteDatabase::open(&path, &SqliteConnectionConfig::default())
         .await
         .unwrap();
      let config = StorageConfig::for_tests(path);
      Scheduler::start(
         db,
         SchedulerPolicy::from(&config),
         Arc::new(StatementCache::default()),
      )
   }

   #[tokio::test]
   async fn test_transaction_step_state_need_not_be_sync() {
      let temp = TempDir::new().unwrap();
      let scheduler = start(&temp).await;

      // Cell is Send but not Sync
      let seen = Cell::new(0_i64);
      let step = TransactionStep::custom(move |conn| {
         Box::pin(async move {
            let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&mut *conn).await?;
            seen.set(one);
            assert_eq!(seen.get(), 1);
            Ok::<_, Error>(())
         })
      });

      let submitted = scheduler.submit(Operation::Transaction { steps: vec![step] }, None);
      assert_send(&submitted);

      let results = submitted.await.unwrap().into_committed().unwrap();
      assert!(results.is_empty());

      scheduler.shutdown().await.unwrap();
   }

   #[tokio::test]
   async fn test_single_operations_and_transactions_share_the_queue() {
      let temp = TempDir::new().unwrap();
      let scheduler = start(&temp).await;

      let steps = vec![
         TransactionStep::statement("CREATE TABLE t (v INTEGER)", vec![]),
         TransactionStep::statement("INSERT INTO t (v) VALUES (?)", vec![7.into()]),
      ];
      scheduler
         .submit(Operation::Transaction { steps }, None)
         .await
         .unwrap();

      let kind = OperationKind::Query {
         sql: "SELECT v FROM t".into(),
         params: vec![],
      };
      let rows = scheduler.submit(kind, None).await.unwrap().into_rows().unwrap();
      assert_eq!(rows[0]["v"], 7);

      scheduler.shutdown().await.unwrap();
   }
}
