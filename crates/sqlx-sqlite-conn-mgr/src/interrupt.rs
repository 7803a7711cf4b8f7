//! Cross-thread interruption of the running statement

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use libsqlite3_sys::sqlite3;
use parking_lot::Mutex;
use tracing::trace;

struct RawConnection(NonNull<sqlite3>);

// SAFETY: the pointer is only handed to sqlite3_interrupt, which SQLite
// documents as safe to call from any thread while the connection is open.
// The owning SqliteDatabase disarms the handle before the connection is
// closed or dropped.
unsafe impl Send for RawConnection {}

/// Handle that can abandon whatever statement the connection is running.
///
/// Cloneable and usable from any task. Once the database is closed the handle
/// is disarmed and [`interrupt`](Self::interrupt) becomes a no-op.
#[derive(Clone)]
pub struct InterruptHandle {
   db: Arc<Mutex<Option<RawConnection>>>,
}

impl InterruptHandle {
   fn new(db: NonNull<sqlite3>) -> Self {
      Self {
         db: Arc::new(Mutex::new(Some(RawConnection(db)))),
      }
   }

   /// Interrupt the statement currently executing on the connection.
   ///
   /// The statement fails with `SQLITE_INTERRUPT`; a write inside an explicit
   /// transaction causes SQLite to roll that transaction back. Returns `false`
   /// if the connection has already been closed.
   pub fn interrupt(&self) -> bool {
      let guard = self.db.lock();
      match guard.as_ref() {
         Some(raw) => {
            // SAFETY: the lock guarantees disarm() has not run, so the
            // connection behind the pointer is still open.
            unsafe { libsqlite3_sys::sqlite3_interrupt(raw.0.as_ptr()) };
            trace!("Interrupt issued on SQLite connection");
            true
         }
         None => false,
      }
   }

   /// Whether the handle still refers to an open connection
   pub fn is_armed(&self) -> bool {
      self.db.lock().is_some()
   }

   fn disarm(&self) {
      self.db.lock().take();
   }
}

/// The owner's copy of the handle. Dropping it disarms every clone, so the
/// raw pointer never outlives the connection.
#[derive(Debug)]
pub(crate) struct ArmedInterrupt(InterruptHandle);

impl ArmedInterrupt {
   pub(crate) fn new(db: NonNull<sqlite3>) -> Self {
      Self(InterruptHandle::new(db))
   }

   pub(crate) fn handle(&self) -> InterruptHandle {
      self.0.clone()
   }

   pub(crate) fn disarm(&self) {
      self.0.disarm();
   }
}

impl Drop for ArmedInterrupt {
   fn drop(&mut self) {
      self.0.disarm();
   }
}

impl fmt::Debug for InterruptHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("InterruptHandle")
         .field("armed", &self.is_armed())
         .finish()
   }
}
