//! Quorum policy for declaring a peer dead.
//!
//! A single observer's suspicion is never enough: a network blip between
//! two nodes must not trigger a takeover. The coordinator waits until the
//! number of distinct observers reporting `Down` for one peer generation
//! reaches the policy's threshold.

use serde::{Deserialize, Serialize};

/// How many agreeing `Down` observations are required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// Simple majority of the currently active nodes (the observer
    /// included): `active / 2 + 1`.
    #[default]
    Majority,
    /// A fixed number of observers regardless of cluster size.
    Fixed(usize),
}

impl QuorumPolicy {
    /// Votes required given `active` live nodes. Never less than one.
    pub fn threshold(&self, active: usize) -> usize {
        match self {
            QuorumPolicy::Majority => majority(active),
            QuorumPolicy::Fixed(n) => (*n).max(1),
        }
    }

    /// Returns true once `votes` meets the threshold for `active` nodes.
    pub fn is_reached(&self, votes: usize, active: usize) -> bool {
        votes >= self.threshold(active)
    }
}

/// Minimum votes for a majority of `total`.
pub fn majority(total: usize) -> usize {
    total / 2 + 1
}
