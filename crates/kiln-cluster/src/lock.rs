//! Cluster-wide named locks.
//!
//! A lock is a row in `cluster_locks` holding the owner msid, a lease
//! expiry, and a fencing token that increases on every acquisition of the
//! name. A row is free when it has no owner or its lease has expired;
//! winning it is a single conditional upsert, so at most one node holds a
//! name at any instant.
//!
//! Within one process the lock is shared: the first caller takes the lease
//! from the store, later callers asking for the same name get a clone of
//! the cached handle and bump a local reference count. The lease goes back
//! to the store only when the count returns to zero (or on an explicit
//! [`NamedLockManager::release`]). The cache is guarded by a plain mutex
//! and never held across an await point.
//!
//! `acquire` is cancel-safe: its only await point is the pause between
//! store attempts, and a won lease is recorded in the cache before the
//! function returns. Dropping the future never leaves a lease behind.
//! Attempts never block on a busy store (another task on this handle, or
//! another process writing); a busy attempt counts as a lost round, so
//! the caller's timeout holds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kiln_store::rusqlite::{params, OptionalExtension};
use kiln_store::{duration_ms, Store};
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ClusterConfig;
use crate::identity::Msid;
use crate::ClusterError;

/// Opaque proof of holding a named lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    name: Arc<str>,
    owner: Msid,
    token: u64,
    expires_at: i64,
}

impl LockHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Msid {
        self.owner
    }

    /// Fencing token: strictly larger for every later holder of this name.
    /// Pass it to external systems so a stale holder's writes can be
    /// rejected.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Store time at which the lease lapses unless renewed.
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }
}

struct LocalLease {
    handle: LockHandle,
    refs: usize,
}

/// Per-process entry point to the cluster's named locks.
pub struct NamedLockManager {
    store: Store,
    owner: Msid,
    poll_interval: Duration,
    lease_ttl: Duration,
    local: Mutex<HashMap<String, LocalLease>>,
}

impl std::fmt::Debug for NamedLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedLockManager")
            .field("owner", &self.owner)
            .field("lease_ttl", &self.lease_ttl)
            .finish_non_exhaustive()
    }
}

impl NamedLockManager {
    pub fn new(store: Store, owner: Msid, config: &ClusterConfig) -> Self {
        Self {
            store,
            owner,
            poll_interval: config.lock_poll_interval(),
            lease_ttl: config.lock_lease_ttl(),
            local: Mutex::new(HashMap::new()),
        }
    }

    /// Acquires `name`, waiting up to `timeout`.
    ///
    /// Returns `LockTimeout` if another node still holds the lease, or the
    /// store stayed busy, when the timeout runs out.
    pub async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockHandle, ClusterError> {
        self.owner.check()?;
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            if let Some(handle) = self.share_local(name) {
                return Ok(handle);
            }
            match self.try_acquire(name) {
                Ok(Some(handle)) => return Ok(handle),
                Ok(None) => {}
                Err(ClusterError::Store(e)) if e.is_transient() => {
                    debug!(lock = name, error = %e, "store busy, will retry lock");
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ClusterError::LockTimeout {
                    name: name.to_string(),
                    waited_ms: now.duration_since(started).as_millis() as u64,
                });
            }
            tokio::time::sleep(self.jittered_pause().min(deadline - now)).await;
        }
    }

    /// Releases the lease if `handle` is still the current holder.
    ///
    /// Returns false when the lease already lapsed and moved on, or was
    /// released before; both are harmless no-ops. Drops every local
    /// reference to this handle.
    pub fn release(&self, handle: &LockHandle) -> Result<bool, ClusterError> {
        {
            let mut local = self.local.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(local.get(handle.name()), Some(l) if l.handle.token == handle.token) {
                local.remove(handle.name());
            }
        }
        self.release_lease(handle)
    }

    /// Drops one local reference. The lease is released in the store when
    /// the last reference goes; returns whether that happened.
    pub fn release_local_ref(&self, handle: &LockHandle) -> Result<bool, ClusterError> {
        let last = {
            let mut local = self.local.lock().unwrap_or_else(|e| e.into_inner());
            match local.get_mut(handle.name()) {
                Some(lease) if lease.handle.token == handle.token => {
                    lease.refs -= 1;
                    if lease.refs == 0 {
                        local.remove(handle.name());
                        true
                    } else {
                        false
                    }
                }
                // not cached (expired locally or already released): let the
                // conditional release decide
                _ => true,
            }
        };
        if last {
            self.release_lease(handle)
        } else {
            Ok(false)
        }
    }

    /// Extends the lease if `handle` is still the live holder.
    pub fn renew(&self, handle: &LockHandle) -> Result<Option<LockHandle>, ClusterError> {
        let now = self.store.now_ms();
        let expires_at = now.saturating_add(duration_ms(self.lease_ttl));
        let changed = self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE cluster_locks SET expires_at = ?4
                 WHERE name = ?1 AND owner_msid = ?2 AND token = ?3 AND expires_at > ?5",
                params![
                    handle.name(),
                    handle.owner.to_sql(),
                    handle.token as i64,
                    expires_at,
                    now
                ],
            )
        })?;
        if changed == 0 {
            return Ok(None);
        }

        let renewed = LockHandle {
            expires_at,
            ..handle.clone()
        };
        let mut local = self.local.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lease) = local.get_mut(handle.name()) {
            if lease.handle.token == handle.token {
                lease.handle = renewed.clone();
            }
        }
        Ok(Some(renewed))
    }

    /// Current live holder of `name` and its fencing token.
    pub fn holder(&self, name: &str) -> Result<Option<(Msid, u64)>, ClusterError> {
        let now = self.store.now_ms();
        self.store.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT owner_msid, token FROM cluster_locks
                     WHERE name = ?1 AND owner_msid IS NOT NULL AND expires_at > ?2",
                    params![name, now],
                    |row| Ok((Msid::from_sql(row.get(0)?), row.get::<_, i64>(1)? as u64)),
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Number of local references to `name` held by this process.
    pub fn local_refs(&self, name: &str) -> usize {
        let local = self.local.lock().unwrap_or_else(|e| e.into_inner());
        local.get(name).map_or(0, |l| l.refs)
    }

    /// Hands out the cached handle if this process holds a live lease.
    fn share_local(&self, name: &str) -> Option<LockHandle> {
        let now = self.store.now_ms();
        let mut local = self.local.lock().unwrap_or_else(|e| e.into_inner());
        let lease = local.get_mut(name)?;
        if lease.handle.expires_at <= now {
            debug!(lock = name, token = lease.handle.token, "cached lease expired");
            local.remove(name);
            return None;
        }
        lease.refs += 1;
        Some(lease.handle.clone())
    }

    /// One attempt at winning the lease in the store. Never waits on a
    /// busy store; records the win in the local cache before returning.
    fn try_acquire(&self, name: &str) -> Result<Option<LockHandle>, ClusterError> {
        let now = self.store.now_ms();
        let expires_at = now.saturating_add(duration_ms(self.lease_ttl));

        let won = self.store.try_transaction(|tx| {
            let previous: Option<(Option<i64>, i64)> = tx
                .query_row(
                    "SELECT owner_msid, expires_at FROM cluster_locks WHERE name = ?1",
                    params![name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let changed = tx.execute(
                "INSERT INTO cluster_locks (name, owner_msid, token, acquired_at, expires_at)
                 VALUES (?1, ?2, 1, ?3, ?4)
                 ON CONFLICT (name) DO UPDATE SET
                    owner_msid = excluded.owner_msid,
                    token = cluster_locks.token + 1,
                    acquired_at = excluded.acquired_at,
                    expires_at = excluded.expires_at
                 WHERE cluster_locks.owner_msid IS NULL
                    OR cluster_locks.expires_at <= excluded.acquired_at",
                params![name, self.owner.to_sql(), now, expires_at],
            )?;
            if changed == 0 {
                return Ok::<_, ClusterError>(None);
            }

            let token: i64 = tx.query_row(
                "SELECT token FROM cluster_locks WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )?;
            if let Some((Some(prev_owner), prev_expiry)) = previous {
                info!(
                    lock = name,
                    previous_owner = prev_owner,
                    expired_at = prev_expiry,
                    "took over expired lease"
                );
            }
            Ok(Some(token as u64))
        })?;

        let Some(token) = won else {
            return Ok(None);
        };
        let handle = LockHandle {
            name: Arc::from(name),
            owner: self.owner,
            token,
            expires_at,
        };
        let mut local = self.local.lock().unwrap_or_else(|e| e.into_inner());
        local.insert(
            name.to_string(),
            LocalLease {
                handle: handle.clone(),
                refs: 1,
            },
        );
        debug!(lock = name, token, "acquired cluster lock");
        Ok(Some(handle))
    }

    fn release_lease(&self, handle: &LockHandle) -> Result<bool, ClusterError> {
        let changed = self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE cluster_locks SET owner_msid = NULL, expires_at = 0
                 WHERE name = ?1 AND owner_msid = ?2 AND token = ?3",
                params![handle.name(), handle.owner.to_sql(), handle.token as i64],
            )
        })?;
        if changed == 1 {
            debug!(lock = handle.name(), token = handle.token, "released cluster lock");
        }
        Ok(changed == 1)
    }

    fn jittered_pause(&self) -> Duration {
        let base = self.poll_interval.as_millis() as u64;
        let jitter = rand::rng().random_range(0..=base / 4);
        Duration::from_millis(base + jitter)
    }
}
