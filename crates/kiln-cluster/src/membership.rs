//! Management-node membership registry.
//!
//! One row per node process, keyed by msid. A node proves it is alive only
//! by heartbeating: each heartbeat stamps `last_update` with the store
//! clock, clears `removed`, resets the alert count and marks the row `Up`.
//! Absence of heartbeats is the only failure signal the cluster has.
//!
//! Liveness queries split the non-removed rows at a cutoff:
//! `active_nodes(c)` holds rows with `last_update > c`, `inactive_nodes(c)`
//! rows with `last_update <= c`. The two are disjoint and together cover
//! every non-removed row for any cutoff.

use kiln_store::rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use kiln_store::rusqlite::{params, OptionalExtension, Row, ToSql};
use kiln_store::Store;
use tracing::{debug, info};

use crate::identity::{Msid, NodeIdentity, RunId};
use crate::ledger::move_frames;
use crate::ClusterError;

const NODE_COLUMNS: &str =
    "id, msid, runid, name, version, service_address, state, last_update, removed, alert_count";

/// Lifecycle state recorded on a node row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Heartbeating, or not yet judged dead.
    Up,
    /// Declared dead by quorum; its frames have been taken over.
    Down,
}

impl NodeState {
    fn as_str(self) -> &'static str {
        match self {
            NodeState::Up => "up",
            NodeState::Down => "down",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for NodeState {
    fn to_sql(&self) -> kiln_store::rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for NodeState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "up" => Ok(NodeState::Up),
            "down" => Ok(NodeState::Down),
            other => Err(FromSqlError::Other(
                format!("unknown node state '{other}'").into(),
            )),
        }
    }
}

/// A management node as recorded in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: i64,
    pub msid: Msid,
    pub runid: RunId,
    pub name: String,
    pub version: String,
    pub service_address: String,
    pub state: NodeState,
    /// Store time of the most recent heartbeat (ms since epoch).
    pub last_update: i64,
    /// Set when the node was retired; cleared by its next heartbeat.
    pub removed: Option<i64>,
    pub alert_count: u32,
}

impl NodeRecord {
    fn from_row(row: &Row<'_>) -> kiln_store::rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            msid: Msid::from_sql(row.get(1)?),
            runid: RunId::from_sql(row.get(2)?),
            name: row.get(3)?,
            version: row.get(4)?,
            service_address: row.get(5)?,
            state: row.get(6)?,
            last_update: row.get(7)?,
            removed: row.get(8)?,
            alert_count: row.get(9)?,
        })
    }

    /// True if this row is not retired.
    pub fn is_member(&self) -> bool {
        self.removed.is_none()
    }
}

/// Store-backed registry of management nodes.
#[derive(Debug, Clone)]
pub struct MembershipRegistry {
    store: Store,
}

impl MembershipRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Records a heartbeat for `identity` and returns the row as stored.
    ///
    /// Creates the row on first call. A heartbeat always un-removes the
    /// node, zeroes its alert count and marks it `Up`. The returned record
    /// is read back in the same transaction, so the caller immediately
    /// sees itself as active.
    ///
    /// A heartbeat carrying an older runid than the stored one is refused
    /// with `Superseded`: a stale incarnation must never refresh the
    /// liveness of its replacement. Ids beyond 63 bits are refused with
    /// `IdOutOfRange` before anything is written.
    pub fn heartbeat(&self, identity: &NodeIdentity) -> Result<NodeRecord, ClusterError> {
        identity.validate()?;
        let now = self.store.now_ms();
        self.store.transaction(|tx| {
            let current: Option<i64> = tx
                .query_row(
                    "SELECT runid FROM nodes WHERE msid = ?1",
                    params![identity.msid.to_sql()],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(current) = current {
                if current > identity.runid.to_sql() {
                    return Err(ClusterError::Superseded {
                        msid: identity.msid,
                        runid: identity.runid,
                        current: RunId::from_sql(current),
                    });
                }
                if current < identity.runid.to_sql() {
                    info!(
                        msid = %identity.msid,
                        runid = %identity.runid,
                        previous = current,
                        "node registered new generation"
                    );
                }
            }

            tx.execute(
                "INSERT INTO nodes (msid, runid, name, version, service_address, state,
                                    last_update, removed, alert_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'up', ?6, NULL, 0)
                 ON CONFLICT (msid) DO UPDATE SET
                    runid = excluded.runid,
                    name = excluded.name,
                    version = excluded.version,
                    service_address = excluded.service_address,
                    state = 'up',
                    last_update = excluded.last_update,
                    removed = NULL,
                    alert_count = 0",
                params![
                    identity.msid.to_sql(),
                    identity.runid.to_sql(),
                    identity.name,
                    identity.version,
                    identity.service_address,
                    now,
                ],
            )?;

            let record = tx.query_row(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE msid = ?1"),
                params![identity.msid.to_sql()],
                NodeRecord::from_row,
            )?;
            Ok(record)
        })
    }

    /// Looks up a node by msid, removed or not.
    pub fn find_by_msid(&self, msid: Msid) -> Result<Option<NodeRecord>, ClusterError> {
        self.store.with_conn(|conn| {
            let record = conn
                .query_row(
                    &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE msid = ?1"),
                    params![msid.to_sql()],
                    NodeRecord::from_row,
                )
                .optional()?;
            Ok(record)
        })
    }

    /// Non-removed nodes that heartbeated after `cutoff`.
    pub fn active_nodes(&self, cutoff: i64) -> Result<Vec<NodeRecord>, ClusterError> {
        self.query(
            "removed IS NULL AND last_update > ?1 ORDER BY msid",
            cutoff,
        )
    }

    /// Non-removed nodes whose last heartbeat is at or before `cutoff`.
    pub fn inactive_nodes(&self, cutoff: i64) -> Result<Vec<NodeRecord>, ClusterError> {
        self.query(
            "removed IS NULL AND last_update <= ?1 ORDER BY msid",
            cutoff,
        )
    }

    /// Every row, removed included.
    pub fn all_nodes(&self) -> Result<Vec<NodeRecord>, ClusterError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY msid"))?;
            let rows = stmt
                .query_map([], NodeRecord::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Increments the node's alert count and returns the new value.
    /// Returns 0 when the node is unknown.
    pub fn record_alert(&self, msid: Msid) -> Result<u32, ClusterError> {
        self.store.transaction(|tx| {
            let changed = tx.execute(
                "UPDATE nodes SET alert_count = alert_count + 1 WHERE msid = ?1",
                params![msid.to_sql()],
            )?;
            if changed == 0 {
                return Ok(0);
            }
            let count: u32 = tx.query_row(
                "SELECT alert_count FROM nodes WHERE msid = ?1",
                params![msid.to_sql()],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Retires a node administratively. Returns false if the node is
    /// unknown or already removed. The node rejoins on its next heartbeat.
    pub fn remove(&self, msid: Msid) -> Result<bool, ClusterError> {
        let now = self.store.now_ms();
        self.store.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE nodes SET removed = ?2 WHERE msid = ?1 AND removed IS NULL",
                params![msid.to_sql(), now],
            )?;
            Ok(changed == 1)
        })
    }

    /// Marks a node `Down`, but only if the row still belongs to `runid`.
    ///
    /// A node that restarted after the decision was made carries a newer
    /// runid and is left untouched.
    pub fn mark_down(&self, msid: Msid, runid: RunId) -> Result<bool, ClusterError> {
        self.store.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE nodes SET state = ?3 WHERE msid = ?1 AND runid = ?2 AND state != ?3",
                params![msid.to_sql(), runid.to_sql(), NodeState::Down],
            )?;
            if changed == 1 {
                debug!(%msid, %runid, "node marked down");
            }
            Ok(changed == 1)
        })
    }

    /// Declares generation `runid` of `msid` down and hands its frames to
    /// `heir`, in one transaction.
    ///
    /// Nothing happens unless the row still carries `runid`, is not yet
    /// `Down`, and has not heartbeated after `cutoff`. A peer that
    /// restarted or came back since the votes were counted keeps its
    /// frames. Returns the number of frames moved, or `None` when the
    /// declaration did not apply.
    pub fn declare_down(
        &self,
        msid: Msid,
        runid: RunId,
        cutoff: i64,
        heir: Msid,
    ) -> Result<Option<usize>, ClusterError> {
        self.store.transaction(|tx| {
            let changed = tx.execute(
                "UPDATE nodes SET state = ?3
                 WHERE msid = ?1 AND runid = ?2 AND state != ?3
                   AND removed IS NULL AND last_update <= ?4",
                params![msid.to_sql(), runid.to_sql(), NodeState::Down, cutoff],
            )?;
            if changed == 0 {
                debug!(%msid, %runid, "peer changed since the vote, not declaring down");
                return Ok(None);
            }
            let moved = move_frames(tx, msid, heir)?;
            Ok(Some(moved))
        })
    }

    /// Picks the runid for a starting process: strictly greater than any
    /// runid on record for `msid`, and no smaller than the store clock.
    pub fn next_runid(&self, msid: Msid) -> Result<RunId, ClusterError> {
        let now = self.store.now_ms().max(1);
        let previous = self.find_by_msid(msid)?.map(|r| r.runid.to_sql());
        let next = match previous {
            Some(prev) => now.max(prev.saturating_add(1)),
            None => now,
        };
        Ok(RunId::from_sql(next))
    }

    fn query(&self, filter: &str, cutoff: i64) -> Result<Vec<NodeRecord>, ClusterError> {
        self.store.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {NODE_COLUMNS} FROM nodes WHERE {filter}"))?;
            let rows = stmt
                .query_map(params![cutoff], NodeRecord::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}
