//! kiln-cluster: coordination for a cluster of management nodes.
//!
//! The nodes of a kiln cluster never talk to each other directly. They
//! coordinate entirely through a shared durable store, which gives them:
//!
//! - **Membership**: heartbeats with stable node ids (msid) and per-process
//!   generations (runid)
//! - **Failure detection**: each node records its own opinion of silent
//!   peers; a peer is declared dead only when enough observers agree
//! - **Named locks**: cluster-wide mutual exclusion with lease expiry and
//!   fencing tokens
//! - **Compensation ledger**: durable undo stacks that a survivor takes
//!   over and replays when their owner dies mid-operation
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use kiln_cluster::{ClusterConfig, Coordinator, DelegateRegistry, MembershipRegistry, Msid, NodeIdentity};
//! use kiln_store::Store;
//!
//! let store = Store::open("/var/lib/kiln/cluster.db")?;
//! let msid = Msid::from_host_identity("mgmt-01.example.net");
//! let runid = MembershipRegistry::new(store.clone()).next_runid(msid)?;
//! let identity = NodeIdentity::new(msid, runid, "mgmt-01", "4.19.0", "10.0.0.1:8250");
//!
//! let (coordinator, events) = Coordinator::new(store, identity, ClusterConfig::default(), DelegateRegistry::new());
//! coordinator.start().await?;
//! ```

mod config;
mod coordinator;
mod error;
mod events;
mod identity;
mod ledger;
mod lock;
mod membership;
mod peers;
mod quorum;
mod replay;

pub use config::ClusterConfig;
pub use coordinator::{Coordinator, StartupReport, TickReport};
pub use error::ClusterError;
pub use events::ClusterEvent;
pub use identity::{ContextId, Msid, NodeIdentity, RunId, MAX_ID};
pub use ledger::{CompensationFrame, CompensationLedger, CompensationScope, Payload};
pub use lock::{LockHandle, NamedLockManager};
pub use membership::{MembershipRegistry, NodeRecord, NodeState};
pub use peers::{PeerLedger, PeerObservation, PeerState};
pub use quorum::{majority, QuorumPolicy};
pub use replay::{
    CompensationDelegate, DelegateError, DelegateFuture, DelegateRegistry, ReplayReport,
    ReplayWorker,
};
