//! Process-isolation guard
//!
//! The connection belongs to exactly one process. A manager that ends up in
//! another process (for example by being inherited across `fork`) must not
//! touch it; callers there are pointed to the message channel instead.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::{Error, Result};

/// Answers whether the current call runs in the process that owns storage.
///
/// The check must be cheap, synchronous and free of side effects.
pub trait ProcessContext: Send + Sync + fmt::Debug {
   fn is_owner(&self) -> bool;

   /// Human-readable description of the calling context for error messages.
   fn describe(&self) -> String;
}

/// Owner is the process that created the manager, identified by PID.
#[derive(Debug, Clone)]
pub struct OwnerProcess {
   pid: u32,
}

impl OwnerProcess {
   pub fn current() -> Self {
      Self {
         pid: std::process::id(),
      }
   }

   pub fn pid(&self) -> u32 {
      self.pid
   }
}

impl ProcessContext for OwnerProcess {
   fn is_owner(&self) -> bool {
      std::process::id() == self.pid
   }

   fn describe(&self) -> String {
      format!(
         "process {} (storage is owned by process {})",
         std::process::id(),
         self.pid
      )
   }
}

#[derive(Debug, Clone)]
pub(crate) struct ProcessGuard {
   context: Arc<dyn ProcessContext>,
   channel: String,
}

impl ProcessGuard {
   pub(crate) fn new(context: Arc<dyn ProcessContext>, channel: impl Into<String>) -> Self {
      Self {
         context,
         channel: channel.into(),
      }
   }

   pub(crate) fn check(&self, operation: &'static str) -> Result<()> {
      if self.context.is_owner() {
         return Ok(());
      }

      let context = self.context.describe();
      warn!(operation, context = %context, "Rejected storage call from non-owning process");
      Err(Error::CrossProcessAccess {
         operation,
         context,
         channel: self.channel.clone(),
      })
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[derive(Debug)]
   struct Foreign;

   impl ProcessContext for Foreign {
      fn is_owner(&self) -> bool {
         false
      }

      fn describe(&self) -> String {
         "renderer process".into()
      }
   }

   #[test]
   fn test_owner_process_passes() {
      let guard = ProcessGuard::new(Arc::new(OwnerProcess::current()), "storage:request");
      assert!(guard.check("query").is_ok());
   }

   #[test]
   fn test_foreign_process_is_rejected_with_guidance() {
      let guard = ProcessGuard::new(Arc::new(Foreign), "storage:request");
      let err = guard.check("execute").unwrap_err();

      assert_eq!(err.error_code(), "CROSS_PROCESS_ACCESS");
      let message = err.to_string();
      assert!(message.contains("`execute`"));
      assert!(message.contains("renderer process"));
      assert!(message.contains("'storage:request' message channel"));
   }

   #[test]
   fn test_owner_process_reports_pid() {
      let owner = OwnerProcess::current();
      assert_eq!(owner.pid(), std::process::id());
      assert!(owner.describe().contains(&owner.pid().to_string()));
   }
}
