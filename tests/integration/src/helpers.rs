//! Test fixtures: a shared database file on a manual clock, and nodes
//! that each open their own handle on it the way separate processes would.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kiln_cluster::{
    ClusterConfig, ClusterEvent, CompensationFrame, Coordinator, DelegateError, DelegateRegistry,
    MembershipRegistry, Msid, NodeIdentity,
};
use kiln_store::{ManualClock, Store};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

pub const VERSION: &str = "4.19.0";

/// Installs a test subscriber once; `RUST_LOG` overrides the filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("kiln_store=warn,kiln_cluster=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// One cluster database shared by every node in a test.
pub struct TestCluster {
    pub clock: ManualClock,
    path: PathBuf,
    _dir: tempfile::TempDir,
}

impl TestCluster {
    pub fn new() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("cluster.db");
        let cluster = Self {
            clock: ManualClock::new(1_700_000_000_000),
            path,
            _dir: dir,
        };
        // create the schema up front
        cluster.open();
        cluster
    }

    /// A fresh connection to the cluster database.
    pub fn open(&self) -> Store {
        Store::open(&self.path)
            .expect("open cluster store")
            .with_clock(self.clock.clone())
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Identity for a starting process of `msid`, with a fresh runid.
    pub fn identity(&self, msid: u64) -> NodeIdentity {
        let runid = MembershipRegistry::new(self.open())
            .next_runid(Msid(msid))
            .expect("next runid");
        NodeIdentity::new(
            Msid(msid),
            runid,
            format!("mgmt-{msid}"),
            VERSION,
            format!("10.0.0.{}:8250", msid / 100),
        )
    }

    pub fn node(&self, msid: u64, config: ClusterConfig, delegates: DelegateRegistry) -> Node {
        self.node_as(self.identity(msid), config, delegates)
    }

    pub fn node_as(
        &self,
        identity: NodeIdentity,
        config: ClusterConfig,
        delegates: DelegateRegistry,
    ) -> Node {
        let (coordinator, events) = Coordinator::new(self.open(), identity, config, delegates);
        Node {
            coordinator: Arc::new(coordinator),
            events,
        }
    }
}

pub struct Node {
    pub coordinator: Arc<Coordinator>,
    pub events: mpsc::Receiver<ClusterEvent>,
}

impl Node {
    /// Everything emitted so far.
    pub fn drain_events(&mut self) -> Vec<ClusterEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }
}

/// Arguments of the volume cleanup actions used in these tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeArgs {
    pub volume: String,
}

impl VolumeArgs {
    pub fn new(volume: &str) -> Self {
        Self {
            volume: volume.to_string(),
        }
    }
}

/// Records every delegate call as `"<delegate> <volume>"`, in call order.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn registry(&self, names: &[&str]) -> DelegateRegistry {
        let mut registry = DelegateRegistry::new();
        for name in names {
            let calls = Arc::clone(&self.0);
            registry.register(*name, move |frame: CompensationFrame| {
                let calls = Arc::clone(&calls);
                async move {
                    let args: VolumeArgs = frame
                        .payload
                        .decode()
                        .map_err(|e| DelegateError::fatal(e.to_string()))?;
                    calls
                        .lock()
                        .unwrap()
                        .push(format!("{} {}", frame.delegate, args.volume));
                    Ok::<_, DelegateError>(())
                }
            });
        }
        registry
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}
