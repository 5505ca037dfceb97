//! Async bridge over the blocking [`Database`].
//!
//! Each call runs on the blocking pool under a deadline. If the deadline
//! passes, or the awaiting future is dropped, the statement currently running
//! for that call is interrupted through SQLite's interrupt handle so the
//! connection is released instead of finishing work nobody will read.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::InterruptHandle;
use tracing::warn;

use crate::Database;
use crate::error::{Result, StoreError};

thread_local! {
    static ACTIVE_CALL: RefCell<Option<Arc<CallState>>> = const { RefCell::new(None) };
}

#[derive(Default)]
struct CallState {
    cancelled: AtomicBool,
    /// Interrupt handle of the connection the call currently holds.
    interrupt: Mutex<Option<Arc<InterruptHandle>>>,
}

impl CallState {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Ok(slot) = self.interrupt.lock() {
            if let Some(handle) = slot.as_ref() {
                handle.interrupt();
            }
        }
    }
}

/// Installs the call on the blocking thread for the duration of `f`.
struct CallScope;

impl CallScope {
    fn enter(call: Arc<CallState>) -> Self {
        ACTIVE_CALL.with(|c| *c.borrow_mut() = Some(call));
        Self
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        ACTIVE_CALL.with(|c| c.borrow_mut().take());
    }
}

/// Registration of a locked connection with the active call, if any.
pub(crate) struct Attached(Option<Arc<CallState>>);

impl Drop for Attached {
    fn drop(&mut self) {
        if let Some(call) = &self.0 {
            if let Ok(mut slot) = call.interrupt.lock() {
                *slot = None;
            }
        }
    }
}

/// Called with the connection lock held. The handle is published before the
/// cancellation flag is read, so a concurrent cancel either sees the handle
/// or is seen here.
pub(crate) fn attach(handle: &Arc<InterruptHandle>) -> Result<Attached> {
    let Some(call) = ACTIVE_CALL.with(|c| c.borrow().clone()) else {
        return Ok(Attached(None));
    };

    if let Ok(mut slot) = call.interrupt.lock() {
        *slot = Some(handle.clone());
    }
    let attached = Attached(Some(call.clone()));

    if call.cancelled.load(Ordering::SeqCst) {
        return Err(StoreError::Cancelled);
    }
    Ok(attached)
}

struct CancelOnDrop {
    call: Arc<CallState>,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.call.cancel();
        }
    }
}

/// Cloneable async handle to the database.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
    timeout: Duration,
}

impl Store {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(db: Database, timeout: Duration) -> Self {
        Self {
            db: Arc::new(db),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run a blocking store operation with the configured deadline.
    /// Store calls are never retried here.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let call = Arc::new(CallState::default());
        let mut guard = CancelOnDrop {
            call: call.clone(),
            armed: true,
        };

        let db = self.db.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _scope = CallScope::enter(call);
            f(&db)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(joined) => {
                guard.armed = false;
                joined.map_err(|e| StoreError::Internal(format!("store task failed: {}", e)))?
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "Store call timed out, interrupting");
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }
}
