//! Error types for store operations.

use thiserror::Error;

/// Errors returned by the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying SQLite call failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem error while opening or preparing the database.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A store call did not finish before the caller's deadline.
    #[error("store call exceeded its {deadline_ms}ms deadline")]
    DeadlineExceeded { deadline_ms: u64 },

    /// The store handle was busy and the caller asked not to wait.
    #[error("store handle is in use")]
    Contended,

    /// The blocking task running a store call panicked or was aborted.
    #[error("store task failed: {0}")]
    TaskFailed(String),

    /// The database was written by a newer binary.
    #[error("schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    /// A row holds a value this binary cannot interpret.
    #[error("corrupt row in {table}: {detail}")]
    CorruptRow { table: &'static str, detail: String },
}

impl StoreError {
    /// Returns true for errors that are expected to clear on retry
    /// (lock contention, busy database, missed deadline).
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::DeadlineExceeded { .. } | StoreError::Contended => true,
            StoreError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Creates a `CorruptRow` error.
    pub fn corrupt(table: &'static str, detail: impl Into<String>) -> Self {
        StoreError::CorruptRow {
            table,
            detail: detail.into(),
        }
    }
}
