//! Table layout for the coordination store.
//!
//! Tables:
//! ```text
//! nodes                one row per management node (msid unique)
//! peer_observations    (owner, peer, peer_runid) -> peer_state
//! cluster_locks        named leases with fencing tokens
//! compensation_frames  per-owner, per-context LIFO cleanup stack
//! ```
//!
//! The schema version lives in `PRAGMA user_version`. Creation is
//! idempotent, so every process runs `apply` on open.

use rusqlite::Connection;
use tracing::debug;

use crate::error::StoreError;

/// Schema version written by this binary.
pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS nodes (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    msid            INTEGER NOT NULL UNIQUE,
    runid           INTEGER NOT NULL,
    name            TEXT    NOT NULL,
    version         TEXT    NOT NULL,
    service_address TEXT    NOT NULL,
    state           TEXT    NOT NULL DEFAULT 'up',
    last_update     INTEGER NOT NULL,
    removed         INTEGER,
    alert_count     INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS nodes_last_update ON nodes (last_update);

CREATE TABLE IF NOT EXISTS peer_observations (
    owner_msid  INTEGER NOT NULL,
    peer_msid   INTEGER NOT NULL,
    peer_runid  INTEGER NOT NULL,
    peer_state  TEXT    NOT NULL,
    updated_at  INTEGER NOT NULL,
    PRIMARY KEY (owner_msid, peer_msid, peer_runid)
);
CREATE INDEX IF NOT EXISTS peer_observations_peer
    ON peer_observations (peer_msid, peer_runid, peer_state);

CREATE TABLE IF NOT EXISTS cluster_locks (
    name        TEXT    PRIMARY KEY,
    owner_msid  INTEGER,
    token       INTEGER NOT NULL,
    acquired_at INTEGER NOT NULL,
    expires_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS compensation_frames (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    msid            INTEGER NOT NULL,
    context_id      INTEGER NOT NULL,
    seq             INTEGER NOT NULL,
    origin_msid     INTEGER NOT NULL,
    origin_context  INTEGER NOT NULL,
    delegate        TEXT    NOT NULL,
    payload_version INTEGER NOT NULL,
    payload         TEXT    NOT NULL,
    created_at      INTEGER NOT NULL,
    attempts        INTEGER NOT NULL DEFAULT 0,
    last_attempt_at INTEGER,
    last_error      TEXT
);
CREATE INDEX IF NOT EXISTS compensation_frames_owner
    ON compensation_frames (msid, context_id, seq);
CREATE INDEX IF NOT EXISTS compensation_frames_origin
    ON compensation_frames (origin_msid, origin_context, seq);
CREATE INDEX IF NOT EXISTS compensation_frames_created
    ON compensation_frames (created_at);
";

/// Creates missing tables and stamps the schema version.
///
/// Fails with `SchemaTooNew` when the database was last written by a
/// binary with a higher schema version; older binaries must not guess at
/// columns they do not know.
pub fn apply(conn: &Connection) -> Result<(), StoreError> {
    let found: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if found > SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found,
            supported: SCHEMA_VERSION,
        });
    }

    conn.execute_batch(SCHEMA_V1)?;

    if found < SCHEMA_VERSION {
        debug!(from = found, to = SCHEMA_VERSION, "stamping schema version");
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    Ok(())
}
