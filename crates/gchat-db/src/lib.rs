pub mod conversations;
pub mod error;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod participants;
pub mod store;
pub mod tokens;
pub mod users;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, InterruptHandle, OpenFlags};
use tracing::info;

pub use error::{Result, StoreError};
pub use models::NewUser;
pub use store::Store;

const READER_POOL_SIZE: usize = 4;

/// How long a connection waits on another writer's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

struct Slot {
    conn: Mutex<Connection>,
    interrupt: Arc<InterruptHandle>,
}

impl Slot {
    fn new(conn: Connection) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Self {
            conn: Mutex::new(conn),
            interrupt,
        }
    }
}

/// SQLite database with a reader/writer split: one writer connection and a
/// small round-robin pool of read-only readers.
///
/// All methods are blocking. Async callers go through [`Store`], which adds a
/// deadline and abandons the statement when the caller goes away.
pub struct Database {
    writer: Slot,
    readers: Vec<Slot>,
    reader_idx: AtomicUsize,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let mut writer = Connection::open(path)?;

        // WAL mode for concurrent reads
        writer.pragma_update(None, "journal_mode", "WAL")?;
        writer.pragma_update(None, "foreign_keys", "ON")?;
        writer.busy_timeout(BUSY_TIMEOUT)?;

        migrations::run(&mut writer)?;

        let mut readers = Vec::with_capacity(READER_POOL_SIZE);
        for _ in 0..READER_POOL_SIZE {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            readers.push(Slot::new(conn));
        }

        info!(
            "Database opened at {} (1 writer + {} readers)",
            path.display(),
            READER_POOL_SIZE
        );
        Ok(Self {
            writer: Slot::new(writer),
            readers,
            reader_idx: AtomicUsize::new(0),
        })
    }

    /// Run `f` on one of the read-only connections.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let idx = self.reader_idx.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        enter(&self.readers[idx], |conn| f(conn))
    }

    /// Run `f` on the writer connection. Transactions must be opened here.
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        enter(&self.writer, f)
    }
}

fn enter<F, T>(slot: &Slot, f: F) -> Result<T>
where
    F: FnOnce(&mut Connection) -> Result<T>,
{
    let mut conn = slot
        .conn
        .lock()
        .map_err(|e| StoreError::Internal(format!("connection lock poisoned: {}", e)))?;
    let _attached = store::attach(&slot.interrupt)?;
    f(&mut conn)
}
