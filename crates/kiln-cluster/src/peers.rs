//! Peer observation ledger.
//!
//! Each node records what it believes about every peer generation it has
//! looked at, keyed by `(owner, peer, peer_runid)`. An owner's newest
//! belief overwrites its previous one, so counting rows per state gives the
//! number of distinct observers currently agreeing: the quorum primitive
//! the coordinator uses before declaring a peer dead.
//!
//! Observations never carry across a peer restart: a new runid starts an
//! empty observation set.

use kiln_store::rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use kiln_store::rusqlite::{params, Row, ToSql};
use kiln_store::Store;
use tracing::debug;

use crate::identity::{Msid, RunId};
use crate::ClusterError;

/// What an observer believes about a peer generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    Up,
    Suspect,
    Down,
}

impl PeerState {
    fn as_str(self) -> &'static str {
        match self {
            PeerState::Up => "up",
            PeerState::Suspect => "suspect",
            PeerState::Down => "down",
        }
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for PeerState {
    fn to_sql(&self) -> kiln_store::rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for PeerState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "up" => Ok(PeerState::Up),
            "suspect" => Ok(PeerState::Suspect),
            "down" => Ok(PeerState::Down),
            other => Err(FromSqlError::Other(
                format!("unknown peer state '{other}'").into(),
            )),
        }
    }
}

/// One observer's current belief about one peer generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerObservation {
    pub owner: Msid,
    pub peer: Msid,
    pub peer_runid: RunId,
    pub state: PeerState,
    pub updated_at: i64,
}

impl PeerObservation {
    fn from_row(row: &Row<'_>) -> kiln_store::rusqlite::Result<Self> {
        Ok(Self {
            owner: Msid::from_sql(row.get(0)?),
            peer: Msid::from_sql(row.get(1)?),
            peer_runid: RunId::from_sql(row.get(2)?),
            state: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }
}

/// Store-backed ledger of peer observations.
#[derive(Debug, Clone)]
pub struct PeerLedger {
    store: Store,
}

impl PeerLedger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Forgets everything `owner` has observed. Called once when `owner`
    /// starts, since its previous generation's beliefs are stale.
    pub fn clear_all(&self, owner: Msid) -> Result<usize, ClusterError> {
        self.store.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM peer_observations WHERE owner_msid = ?1",
                params![owner.to_sql()],
            )?;
            if removed > 0 {
                debug!(%owner, removed, "cleared stale peer observations");
            }
            Ok(removed)
        })
    }

    /// Records `owner`'s current belief about `(peer, peer_runid)`.
    /// Idempotent: repeating the call leaves a single row.
    pub fn set_observation(
        &self,
        owner: Msid,
        peer: Msid,
        peer_runid: RunId,
        state: PeerState,
    ) -> Result<(), ClusterError> {
        let now = self.store.now_ms();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO peer_observations (owner_msid, peer_msid, peer_runid, peer_state, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (owner_msid, peer_msid, peer_runid) DO UPDATE SET
                    peer_state = excluded.peer_state,
                    updated_at = excluded.updated_at",
                params![owner.to_sql(), peer.to_sql(), peer_runid.to_sql(), state, now],
            )?;
            Ok(())
        })
    }

    /// Number of distinct observers currently reporting `state` for
    /// `(peer, peer_runid)`.
    pub fn count_agreeing(
        &self,
        peer: Msid,
        peer_runid: RunId,
        state: PeerState,
    ) -> Result<usize, ClusterError> {
        self.store.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT owner_msid) FROM peer_observations
                 WHERE peer_msid = ?1 AND peer_runid = ?2 AND peer_state = ?3",
                params![peer.to_sql(), peer_runid.to_sql(), state],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    /// All current observations of `(peer, peer_runid)`, ordered by owner.
    pub fn observations_for(
        &self,
        peer: Msid,
        peer_runid: RunId,
    ) -> Result<Vec<PeerObservation>, ClusterError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT owner_msid, peer_msid, peer_runid, peer_state, updated_at
                 FROM peer_observations
                 WHERE peer_msid = ?1 AND peer_runid = ?2
                 ORDER BY owner_msid",
            )?;
            let rows = stmt
                .query_map(
                    params![peer.to_sql(), peer_runid.to_sql()],
                    PeerObservation::from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Drops every observer's rows about generations of `peer` older than
    /// `runid`. Those generations are gone; their votes can never matter.
    pub fn forget_generations_before(&self, peer: Msid, runid: RunId) -> Result<usize, ClusterError> {
        self.store.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM peer_observations WHERE peer_msid = ?1 AND peer_runid < ?2",
                params![peer.to_sql(), runid.to_sql()],
            )?;
            Ok(removed)
        })
    }
}
