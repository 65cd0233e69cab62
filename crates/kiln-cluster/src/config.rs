//! Cluster configuration.
//!
//! Built once at startup and shared by reference; nothing here is mutated
//! at runtime. Durations are stored as integer milliseconds so the TOML
//! form stays flat and readable, with `Duration` accessors for code.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::quorum::QuorumPolicy;
use crate::ClusterError;

/// Tunables for heartbeat, failure detection, locking and replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// How often each node heartbeats and scans its peers.
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before a peer counts as inactive.
    pub missed_beat_tolerance: u32,
    /// Alerts a peer must accumulate before observers report it `Down`
    /// rather than `Suspect`.
    pub alerts_before_down: u32,
    /// Agreement required before taking over a dead peer's frames.
    pub quorum: QuorumPolicy,
    /// Deadline for a single store call issued by the coordinator.
    pub store_timeout_ms: u64,
    /// Pause between attempts while waiting on a named lock.
    pub lock_poll_interval_ms: u64,
    /// Lease length of a named lock; bounds how long a crashed holder
    /// blocks everyone else.
    pub lock_lease_ttl_ms: u64,
    /// Upper bound on one compensation delegate invocation.
    pub delegate_timeout_ms: u64,
    /// Failed replays of one frame before an operator alert is raised.
    pub replay_max_attempts: u32,
    /// Base retry backoff for a failed replay; doubles per attempt.
    pub replay_backoff_ms: u64,
    /// Cap on the replay retry backoff.
    pub replay_backoff_max_ms: u64,
    /// Drop this node's own leftover frames on start instead of replaying
    /// them. Only for restarts known to be safe.
    pub discard_leftovers_on_start: bool,
    /// Capacity of the cluster event channel.
    pub event_channel_capacity: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1_500,
            missed_beat_tolerance: 3,
            alerts_before_down: 2,
            quorum: QuorumPolicy::Majority,
            store_timeout_ms: 5_000,
            lock_poll_interval_ms: 50,
            lock_lease_ttl_ms: 300_000,
            delegate_timeout_ms: 30_000,
            replay_max_attempts: 5,
            replay_backoff_ms: 1_000,
            replay_backoff_max_ms: 60_000,
            discard_leftovers_on_start: false,
            event_channel_capacity: 256,
        }
    }
}

impl ClusterConfig {
    /// Parses a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(input: &str) -> Result<Self, ClusterError> {
        let cfg: Self =
            toml::from_str(input).map_err(|e| ClusterError::Configuration(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serializes the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ClusterError> {
        toml::to_string_pretty(self).map_err(|e| ClusterError::Configuration(e.to_string()))
    }

    /// Rejects values that would make failure detection or replay unsound.
    pub fn validate(&self) -> Result<(), ClusterError> {
        let invalid = |msg: &str| Err(ClusterError::Configuration(msg.to_string()));

        if self.heartbeat_interval_ms == 0 {
            return invalid("heartbeat_interval_ms must be greater than zero");
        }
        if self.missed_beat_tolerance == 0 {
            return invalid("missed_beat_tolerance must be at least 1");
        }
        if self.alerts_before_down == 0 {
            return invalid("alerts_before_down must be at least 1");
        }
        if self.quorum == QuorumPolicy::Fixed(0) {
            return invalid("fixed quorum must be at least 1");
        }
        if self.store_timeout_ms == 0 {
            return invalid("store_timeout_ms must be greater than zero");
        }
        if self.lock_poll_interval_ms == 0 {
            return invalid("lock_poll_interval_ms must be greater than zero");
        }
        if self.lock_lease_ttl_ms <= self.lock_poll_interval_ms {
            return invalid("lock_lease_ttl_ms must exceed lock_poll_interval_ms");
        }
        if self.replay_max_attempts == 0 {
            return invalid("replay_max_attempts must be at least 1");
        }
        if self.replay_backoff_max_ms < self.replay_backoff_ms {
            return invalid("replay_backoff_max_ms must be at least replay_backoff_ms");
        }
        if self.event_channel_capacity == 0 {
            return invalid("event_channel_capacity must be greater than zero");
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence after which a peer's last heartbeat is considered stale.
    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_interval()
            .saturating_mul(self.missed_beat_tolerance)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn lock_lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ttl_ms)
    }

    pub fn delegate_timeout(&self) -> Duration {
        Duration::from_millis(self.delegate_timeout_ms)
    }

    /// Backoff before retrying a frame that has failed `attempts` times.
    pub fn replay_backoff(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let shift = (attempts - 1).min(20);
        let ms = self
            .replay_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.replay_backoff_max_ms);
        Duration::from_millis(ms)
    }
}
