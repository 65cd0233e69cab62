//! SQLite-backed coordination store.
//!
//! A `Store` is a cheap, cloneable handle to one SQLite connection guarded
//! by a mutex. Clones share the connection and the clock, so several
//! in-process components (or simulated nodes in tests) observe one
//! serialized history. Separate OS processes share a store by opening the
//! same database file; WAL mode and a busy timeout let them interleave.
//!
//! All writes that must be atomic run inside [`Store::transaction`], which
//! takes SQLite's write lock up front (`BEGIN IMMEDIATE`) so conditional
//! updates cannot interleave with another writer between read and write.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::schema;
use crate::time::{Clock, SystemClock};

/// How long SQLite waits on a locked database file before returning BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle to the shared durable store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    path: Option<PathBuf>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (or creates) a file-backed store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        schema::apply(&conn)?;
        debug!(path = %path.display(), journal_mode = %mode, "opened store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates a private in-memory store. Clones of the returned handle
    /// share it; nothing outlives the last clone.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        schema::apply(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
            path: None,
        })
    }

    /// Replaces the store clock (builder style).
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Current store time in milliseconds since the Unix epoch.
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Path of the backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Runs `f` against the connection outside an explicit transaction.
    /// Each statement is atomic on its own.
    pub fn with_conn<T, E>(&self, f: impl FnOnce(&Connection) -> Result<T, E>) -> Result<T, E> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&conn)
    }

    /// Runs `f` inside an immediate transaction. The transaction commits
    /// only if `f` returns `Ok`; any error rolls every statement back.
    pub fn transaction<T, E>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        immediate(&mut conn, f)
    }

    /// Like [`Store::transaction`], but never waits.
    ///
    /// Fails with `Contended` when another task is using this handle, and
    /// with SQLite's BUSY error when another connection holds the write
    /// lock. Both are transient; the caller decides when to try again.
    pub fn try_transaction<T, E>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut conn = match self.conn.try_lock() {
            Ok(conn) => conn,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(StoreError::Contended.into()),
        };
        conn.busy_timeout(Duration::ZERO).map_err(StoreError::from)?;
        let out = immediate(&mut conn, f);
        if let Err(e) = conn.busy_timeout(BUSY_TIMEOUT) {
            warn!(error = %e, "failed to restore busy timeout");
        }
        out
    }
}

fn immediate<T, E>(
    conn: &mut Connection,
    f: impl FnOnce(&Transaction<'_>) -> Result<T, E>,
) -> Result<T, E>
where
    E: From<StoreError>,
{
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(StoreError::from)?;
    let out = f(&tx)?;
    tx.commit().map_err(StoreError::from)?;
    Ok(out)
}

/// Runs a blocking store call on the blocking thread pool, bounded by
/// `deadline`.
///
/// On expiry the caller gets `DeadlineExceeded` immediately. The blocking
/// call itself keeps running until SQLite returns; since every store
/// operation is a single transaction it either lands whole or not at all.
pub async fn run_blocking<T, E, F>(deadline: Duration, f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<StoreError> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(deadline, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(StoreError::TaskFailed(join.to_string()).into()),
        Err(_) => Err(StoreError::DeadlineExceeded {
            deadline_ms: deadline.as_millis() as u64,
        }
        .into()),
    }
}
