//! Compensation ledger: durable LIFO stacks of undo actions.
//!
//! Before a node starts a multi-step operation with external side effects
//! it pushes one frame per step describing how to undo it, and pops the
//! frame once the step is safely finished. Frames are scoped to
//! `(msid, context)`, where the context is the caller's execution context.
//!
//! Frames survive their owner. When a node dies, a survivor moves all of
//! its frames to itself under context 0 (the orphan context) in a single
//! update, and the replay worker runs them newest-first per original
//! group. `origin_msid`/`origin_context` never change after push, so that
//! ordering holds across repeated takeovers.

use kiln_store::rusqlite::types::Type;
use kiln_store::rusqlite::{params, Connection, OptionalExtension, Row};
use kiln_store::Store;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::identity::{ContextId, Msid};
use crate::ClusterError;

const FRAME_COLUMNS: &str = "id, msid, context_id, seq, origin_msid, origin_context, delegate, \
                             payload_version, payload, created_at, attempts, last_attempt_at, \
                             last_error";

/// Versioned, structured arguments of a compensation action.
///
/// `version` belongs to the delegate: bump it when the shape of `fields`
/// changes so a newer binary can still decode frames written by an older
/// one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub version: u32,
    pub fields: serde_json::Value,
}

impl Payload {
    pub fn encode<T: Serialize>(version: u32, value: &T) -> Result<Self, ClusterError> {
        Ok(Self {
            version,
            fields: serde_json::to_value(value)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ClusterError> {
        Ok(T::deserialize(&self.fields)?)
    }
}

/// One recorded undo action.
#[derive(Debug, Clone, PartialEq)]
pub struct CompensationFrame {
    pub id: i64,
    /// Current owner.
    pub msid: Msid,
    /// Current context; [`ContextId::ORPHANED`] once taken over.
    pub context: ContextId,
    /// Position in the original stack, 1 for the oldest frame.
    pub seq: u64,
    pub origin_msid: Msid,
    pub origin_context: ContextId,
    /// Registry key of the action that undoes this step.
    pub delegate: String,
    pub payload: Payload,
    pub created_at: i64,
    /// Failed replay attempts so far.
    pub attempts: u32,
    pub last_attempt_at: Option<i64>,
    pub last_error: Option<String>,
}

impl CompensationFrame {
    fn from_row(row: &Row<'_>) -> kiln_store::rusqlite::Result<Self> {
        let text: String = row.get(8)?;
        let fields = serde_json::from_str(&text).map_err(|e| {
            kiln_store::rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e))
        })?;
        Ok(Self {
            id: row.get(0)?,
            msid: Msid::from_sql(row.get(1)?),
            context: ContextId::from_sql(row.get(2)?),
            seq: row.get::<_, i64>(3)? as u64,
            origin_msid: Msid::from_sql(row.get(4)?),
            origin_context: ContextId::from_sql(row.get(5)?),
            delegate: row.get(6)?,
            payload: Payload {
                version: row.get(7)?,
                fields,
            },
            created_at: row.get(9)?,
            attempts: row.get(10)?,
            last_attempt_at: row.get(11)?,
            last_error: row.get(12)?,
        })
    }

    /// The stack this frame was originally pushed onto.
    pub fn origin(&self) -> (Msid, ContextId) {
        (self.origin_msid, self.origin_context)
    }
}

/// Moves every frame of `dead` to `new` under the orphan context, inside
/// whatever transaction `conn` is part of.
pub(crate) fn move_frames(
    conn: &Connection,
    dead: Msid,
    new: Msid,
) -> kiln_store::rusqlite::Result<usize> {
    let moved = conn.execute(
        "UPDATE compensation_frames SET msid = ?2, context_id = 0 WHERE msid = ?1",
        params![dead.to_sql(), new.to_sql()],
    )?;
    if moved > 0 {
        info!(%dead, %new, moved, "took over compensation frames");
    }
    Ok(moved)
}

/// Store-backed compensation ledger.
#[derive(Debug, Clone)]
pub struct CompensationLedger {
    store: Store,
}

impl CompensationLedger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Pushes a frame onto `(msid, ctx)` and returns its id.
    ///
    /// The sequence number is computed in the insert itself, so concurrent
    /// pushes to one stack can never share a `seq`. It counts over every
    /// frame still carrying this origin, orphaned ones included, so a stack
    /// reused after a takeover keeps numbering above its older frames.
    pub fn push(
        &self,
        msid: Msid,
        ctx: ContextId,
        delegate: &str,
        payload: &Payload,
    ) -> Result<i64, ClusterError> {
        if ctx.is_orphaned() {
            return Err(ClusterError::ReservedContext);
        }
        msid.check()?;
        ctx.check()?;
        let fields = serde_json::to_string(&payload.fields)?;
        let now = self.store.now_ms();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO compensation_frames
                    (msid, context_id, seq, origin_msid, origin_context, delegate,
                     payload_version, payload, created_at)
                 SELECT ?1, ?2, COALESCE(MAX(seq), 0) + 1, ?1, ?2, ?3, ?4, ?5, ?6
                 FROM compensation_frames WHERE origin_msid = ?1 AND origin_context = ?2",
                params![
                    msid.to_sql(),
                    ctx.to_sql(),
                    delegate,
                    payload.version,
                    fields,
                    now
                ],
            )?;
            let id = conn.last_insert_rowid();
            debug!(%msid, context = %ctx, delegate, id, "pushed compensation frame");
            Ok(id)
        })
    }

    /// Removes and returns the newest frame of `(msid, ctx)`.
    ///
    /// Returns `None` when the stack is empty, including when its frames
    /// were taken over by another node in the meantime.
    pub fn pop(&self, msid: Msid, ctx: ContextId) -> Result<Option<CompensationFrame>, ClusterError> {
        self.store.transaction(|tx| {
            let top = tx
                .query_row(
                    &format!(
                        "SELECT {FRAME_COLUMNS} FROM compensation_frames
                         WHERE msid = ?1 AND context_id = ?2
                         ORDER BY seq DESC LIMIT 1"
                    ),
                    params![msid.to_sql(), ctx.to_sql()],
                    CompensationFrame::from_row,
                )
                .optional()?;
            let Some(frame) = top else {
                return Ok(None);
            };

            let deleted = tx.execute(
                "DELETE FROM compensation_frames WHERE id = ?1 AND msid = ?2 AND context_id = ?3",
                params![frame.id, msid.to_sql(), ctx.to_sql()],
            )?;
            if deleted == 0 {
                debug!(%msid, context = %ctx, id = frame.id, "frame moved before pop");
                return Ok(None);
            }
            Ok(Some(frame))
        })
    }

    /// Deletes every frame owned by `msid`.
    pub fn clear(&self, msid: Msid) -> Result<usize, ClusterError> {
        self.store.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM compensation_frames WHERE msid = ?1",
                params![msid.to_sql()],
            )?;
            if removed > 0 {
                info!(%msid, removed, "discarded compensation frames");
            }
            Ok(removed)
        })
    }

    /// Every frame owned by `msid`, grouped by context, newest first.
    pub fn leftovers(&self, msid: Msid) -> Result<Vec<CompensationFrame>, ClusterError> {
        self.select(
            "msid = ?1 ORDER BY context_id, seq DESC",
            params![msid.to_sql()],
        )
    }

    /// Frames of any owner pushed before `cutoff`.
    pub fn leftovers_older_than(&self, cutoff: i64) -> Result<Vec<CompensationFrame>, ClusterError> {
        self.select(
            "created_at < ?1 ORDER BY msid, context_id, seq DESC",
            params![cutoff],
        )
    }

    /// Moves every frame of `dead` to `new` under the orphan context.
    ///
    /// One statement: either all of them move or none do. A second call
    /// for the same dead node finds nothing and returns 0.
    pub fn takeover(&self, dead: Msid, new: Msid) -> Result<usize, ClusterError> {
        self.store.with_conn(|conn| Ok(move_frames(conn, dead, new)?))
    }

    /// Orphaned frames awaiting replay by `msid`, grouped by original
    /// stack, newest first within each group.
    pub fn claimable(&self, msid: Msid) -> Result<Vec<CompensationFrame>, ClusterError> {
        self.select(
            "msid = ?1 AND context_id = 0
             ORDER BY origin_msid, origin_context, seq DESC, id DESC",
            params![msid.to_sql()],
        )
    }

    /// Deletes a replayed frame if `msid` still owns it.
    pub fn complete(&self, frame_id: i64, msid: Msid) -> Result<bool, ClusterError> {
        self.store.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM compensation_frames WHERE id = ?1 AND msid = ?2",
                params![frame_id, msid.to_sql()],
            )?;
            Ok(deleted == 1)
        })
    }

    /// Records a failed replay and returns the new attempt count, or 0 if
    /// `msid` no longer owns the frame.
    pub fn record_failure(&self, frame_id: i64, msid: Msid, error: &str) -> Result<u32, ClusterError> {
        let now = self.store.now_ms();
        self.store.transaction(|tx| {
            let changed = tx.execute(
                "UPDATE compensation_frames
                 SET attempts = attempts + 1, last_attempt_at = ?3, last_error = ?4
                 WHERE id = ?1 AND msid = ?2",
                params![frame_id, msid.to_sql(), now, error],
            )?;
            if changed == 0 {
                return Ok(0);
            }
            let attempts: u32 = tx.query_row(
                "SELECT attempts FROM compensation_frames WHERE id = ?1",
                params![frame_id],
                |row| row.get(0),
            )?;
            Ok(attempts)
        })
    }

    pub fn frame(&self, id: i64) -> Result<Option<CompensationFrame>, ClusterError> {
        self.store.with_conn(|conn| {
            let frame = conn
                .query_row(
                    &format!("SELECT {FRAME_COLUMNS} FROM compensation_frames WHERE id = ?1"),
                    params![id],
                    CompensationFrame::from_row,
                )
                .optional()?;
            Ok(frame)
        })
    }

    /// Current store time, for callers comparing against frame timestamps.
    pub fn now_ms(&self) -> i64 {
        self.store.now_ms()
    }

    fn select(
        &self,
        filter: &str,
        args: impl kiln_store::rusqlite::Params,
    ) -> Result<Vec<CompensationFrame>, ClusterError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FRAME_COLUMNS} FROM compensation_frames WHERE {filter}"
            ))?;
            let frames = stmt
                .query_map(args, CompensationFrame::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(frames)
        })
    }
}

/// A compensation stack bound to one `(msid, ctx)`.
///
/// Convenience for code that pushes and pops many frames within one
/// execution context. Dropping it does nothing; unpopped frames stay in
/// the ledger for recovery.
#[derive(Debug, Clone)]
pub struct CompensationScope {
    ledger: CompensationLedger,
    msid: Msid,
    ctx: ContextId,
}

impl CompensationScope {
    pub fn new(ledger: CompensationLedger, msid: Msid, ctx: ContextId) -> Result<Self, ClusterError> {
        if ctx.is_orphaned() {
            return Err(ClusterError::ReservedContext);
        }
        Ok(Self { ledger, msid, ctx })
    }

    pub fn context(&self) -> ContextId {
        self.ctx
    }

    pub fn push<T: Serialize>(
        &self,
        delegate: &str,
        version: u32,
        args: &T,
    ) -> Result<i64, ClusterError> {
        let payload = Payload::encode(version, args)?;
        self.ledger.push(self.msid, self.ctx, delegate, &payload)
    }

    pub fn pop(&self) -> Result<Option<CompensationFrame>, ClusterError> {
        self.ledger.pop(self.msid, self.ctx)
    }
}
