//! # sqlx-sqlite-conn-mgr
//!
//! A minimal wrapper around SQLx that opens and owns the single read-write
//! SQLite connection of an embedded, single-writer store.
//!
//! ## Core Types
//!
//! - **[`SqliteDatabase`]**: Owner of the one connection; applies and verifies pragmas
//! - **[`SqliteConnectionConfig`]**: Busy timeout, cache size and page size settings
//! - **[`InterruptHandle`]**: Thread-safe handle that abandons the running statement
//! - **[`Error`]**: Error type for database operations
//!
//! ## Policy
//!
//! - **One connection**: The engine has a single writer, so there is no pool
//! - **WAL always**: Write-Ahead Logging is enabled and verified at open
//! - **Foreign keys on**: Enforcement is enabled and verified at open
//! - **Busy timeout floor**: Never less than five seconds

mod config;
mod database;
mod error;
mod interrupt;

// Re-export public types
pub use config::{MIN_BUSY_TIMEOUT, SqliteConnectionConfig};
pub use database::SqliteDatabase;
pub use error::{Error, Result};
pub use interrupt::InterruptHandle;
