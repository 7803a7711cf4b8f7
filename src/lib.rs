//! # app-storage
//!
//! Single-writer transactional storage manager for a desktop application's
//! durable state: sessions, tab groups, bookmarks and settings.
//!
//! ## Architecture
//!
//! - **One connection**: [`StorageManager`] opens a single SQLite connection
//!   (WAL, foreign keys, busy timeout) and bootstraps the schema
//! - **One dispatcher**: every query, execute and transaction is queued FIFO
//!   and run one at a time, with queue and run deadlines, busy/locked retry
//!   and a global abort
//! - **Atomic transactions**: `BEGIN IMMEDIATE`, full rollback on any failed step
//! - **Statement cache**: identity-stable prepared statements per connection
//! - **Process isolation**: calls from a process that does not own the
//!   connection are rejected with guidance to use the message channel
//!
//! ## Example
//!
//! ```no_run
//! use app_storage::{StorageConfig, StorageManager};
//!
//! # async fn run() -> app_storage::Result<()> {
//! let storage = StorageManager::new(StorageConfig::new("/var/lib/app/storage.db"))?;
//! storage.initialize().await?;
//!
//! storage
//!    .execute(
//!       "INSERT INTO sessions (tabs, timestamp, version) VALUES (?, ?, ?)",
//!       vec!["[]".into(), 1234.into(), "1.0".into()],
//!    )
//!    .await?;
//!
//! let rows = storage.query("SELECT COUNT(*) AS count FROM sessions", vec![]).await?;
//! assert_eq!(rows[0]["count"], 1);
//!
//! storage.close().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod decode;
mod error;
mod guard;
mod health;
mod manager;
mod registry;
mod scheduler;
mod schema;
mod statement_cache;
mod transactions;
mod value;

pub use config::{RetryPolicy, StorageConfig};
pub use decode::Row;
pub use error::{Error, Result};
pub use guard::{OwnerProcess, ProcessContext};
pub use health::Diagnostics;
pub use manager::StorageManager;
pub use registry::StorageRegistry;
pub use scheduler::operation::{ExecuteResult, OperationState};
pub use schema::{DATA_TABLES, INDICES, SCHEMA_VERSION, TABLES};
pub use statement_cache::PreparedStatement;
pub use transactions::{Statement, StepFn, TransactionStep};
pub use value::SqlValue;
