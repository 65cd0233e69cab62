//! Error types for cluster operations.

use kiln_store::StoreError;

use crate::{Msid, RunId};

/// Errors that can occur during cluster operations.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The shared store failed or missed its deadline.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A named lock could not be acquired before the timeout.
    ///
    /// This is an ordinary outcome under contention; the caller decides
    /// whether to retry or abandon the protected action.
    #[error("timed out after {waited_ms}ms waiting for lock '{name}'")]
    LockTimeout { name: String, waited_ms: u64 },

    /// Context id 0 marks orphaned frames and cannot own a stack.
    #[error("context id 0 is reserved for orphaned compensation frames")]
    ReservedContext,

    /// A compensation payload could not be encoded or decoded.
    #[error("payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),

    /// A heartbeat came from an older generation than the one on record.
    #[error("node {msid} runid {runid} superseded by runid {current}")]
    Superseded {
        msid: Msid,
        runid: RunId,
        current: RunId,
    },

    /// An id does not fit the store's signed 64-bit integers.
    #[error("{kind} {value} exceeds the 63-bit id range")]
    IdOutOfRange { kind: &'static str, value: u64 },

    /// Configuration error.
    #[error("invalid cluster configuration: {0}")]
    Configuration(String),
}

impl From<kiln_store::rusqlite::Error> for ClusterError {
    fn from(e: kiln_store::rusqlite::Error) -> Self {
        ClusterError::Store(StoreError::Database(e))
    }
}

impl ClusterError {
    /// Returns true if retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClusterError::Store(e) => e.is_transient(),
            ClusterError::LockTimeout { .. } => true,
            _ => false,
        }
    }
}
