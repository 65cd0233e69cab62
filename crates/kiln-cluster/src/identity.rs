//! Node and execution-context identity.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ClusterError;

/// Largest id value that fits SQLite's signed 64-bit integers.
pub const MAX_ID: u64 = i64::MAX as u64;

fn check_id(kind: &'static str, value: u64) -> Result<(), ClusterError> {
    if value > MAX_ID {
        return Err(ClusterError::IdOutOfRange { kind, value });
    }
    Ok(())
}

/// Namespace for deriving msids from host identities.
const MSID_NAMESPACE: Uuid = Uuid::from_u128(0x6b69_6c6e_2d6d_7369_642d_6e73_0000_0001);

/// Stable identity of one management node. Survives process restarts.
///
/// Limited to 63 bits ([`MAX_ID`]) so it round-trips through SQLite's
/// signed integers. Larger values are refused when they first reach the
/// store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Msid(pub u64);

impl Msid {
    /// Derives an msid from a host identity string (hostname, MAC address,
    /// machine id). The same input always yields the same msid.
    pub fn from_host_identity(host: &str) -> Self {
        let id = Uuid::new_v5(&MSID_NAMESPACE, host.as_bytes());
        let (hi, _) = id.as_u64_pair();
        Self(hi & MAX_ID)
    }

    pub(crate) fn check(self) -> Result<Self, ClusterError> {
        check_id("msid", self.0)?;
        Ok(self)
    }

    pub(crate) fn to_sql(self) -> i64 {
        self.0 as i64
    }

    pub(crate) fn from_sql(v: i64) -> Self {
        Self(v as u64)
    }
}

impl std::fmt::Display for Msid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generation number of one node process. A new, larger value is chosen
/// every time the process starts. Same 63-bit limit as [`Msid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub u64);

impl RunId {
    pub(crate) fn check(self) -> Result<Self, ClusterError> {
        check_id("runid", self.0)?;
        Ok(self)
    }

    pub(crate) fn to_sql(self) -> i64 {
        self.0 as i64
    }

    pub(crate) fn from_sql(v: i64) -> Self {
        Self(v as u64)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-supplied execution context that scopes a compensation stack.
///
/// Plays the role an OS thread id would in a one-thread-per-request
/// server: each in-flight operation passes its own context id down, and
/// push/pop ordering holds only within one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(pub u64);

impl ContextId {
    /// Reserved: the frame has no live owner and is waiting for replay.
    pub const ORPHANED: ContextId = ContextId(0);

    pub fn is_orphaned(self) -> bool {
        self == Self::ORPHANED
    }

    pub(crate) fn check(self) -> Result<Self, ClusterError> {
        check_id("context id", self.0)?;
        Ok(self)
    }

    pub(crate) fn to_sql(self) -> i64 {
        self.0 as i64
    }

    pub(crate) fn from_sql(v: i64) -> Self {
        Self(v as u64)
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Everything a node advertises about itself in its heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub msid: Msid,
    pub runid: RunId,
    pub name: String,
    pub version: String,
    /// `host:port` peers and schedulers use to reach this node.
    pub service_address: String,
}

impl NodeIdentity {
    pub fn new(
        msid: Msid,
        runid: RunId,
        name: impl Into<String>,
        version: impl Into<String>,
        service_address: impl Into<String>,
    ) -> Self {
        Self {
            msid,
            runid,
            name: name.into(),
            version: version.into(),
            service_address: service_address.into(),
        }
    }

    /// Fails if the msid or runid does not fit the store's integers.
    pub fn validate(&self) -> Result<(), ClusterError> {
        self.msid.check()?;
        self.runid.check()?;
        Ok(())
    }
}
