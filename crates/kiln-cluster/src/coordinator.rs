//! Cluster coordinator: the per-node control loop.
//!
//! Every heartbeat interval the coordinator refreshes this node's row,
//! scans for peers that stopped heartbeating, records its own opinion of
//! each one in the peer ledger, and once enough observers agree a peer
//! generation is dead, moves that peer's compensation frames to itself
//! and replays them.
//!
//! All store access goes through the blocking pool with a deadline, so a
//! wedged database shows up as a skipped cycle instead of a stuck runtime.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use kiln_store::{duration_ms, run_blocking, Store};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;
use crate::events::{emit, ClusterEvent};
use crate::identity::{ContextId, Msid, NodeIdentity};
use crate::ledger::{CompensationLedger, CompensationScope};
use crate::lock::NamedLockManager;
use crate::membership::{MembershipRegistry, NodeRecord, NodeState};
use crate::peers::{PeerLedger, PeerState};
use crate::replay::{DelegateRegistry, ReplayReport, ReplayWorker};
use crate::ClusterError;

/// What [`Coordinator::start`] found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupReport {
    /// This node's row after the first heartbeat.
    pub record: NodeRecord,
    /// Observations left behind by this node's previous generation.
    pub cleared_observations: usize,
    /// Other nodes' observations about this node's older generations.
    pub forgotten_observations: usize,
    /// Own leftover frames moved to the orphan context for replay.
    pub recovered_frames: usize,
    /// Own leftover frames dropped because discarding was configured.
    pub discarded_frames: usize,
    pub replay: ReplayReport,
}

/// What one [`Coordinator::tick`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// False when the heartbeat failed and the rest of the cycle was
    /// skipped.
    pub heartbeat_ok: bool,
    /// Live members, this node included.
    pub active: usize,
    /// Peers observed `Suspect` or `Down` this cycle.
    pub suspected: Vec<Msid>,
    /// Peers this node declared down this cycle.
    pub declared_down: Vec<Msid>,
    /// Frames this node took over this cycle.
    pub frames_taken_over: usize,
    pub replay: ReplayReport,
}

#[derive(Debug, Clone)]
struct Tables {
    membership: MembershipRegistry,
    peers: PeerLedger,
    ledger: CompensationLedger,
}

/// Per-node cluster coordinator.
pub struct Coordinator {
    identity: NodeIdentity,
    config: Arc<ClusterConfig>,
    store: Store,
    tables: Tables,
    locks: Arc<NamedLockManager>,
    replay: ReplayWorker,
    event_tx: mpsc::Sender<ClusterEvent>,
    /// Flipped by `leave`; stops replay between frames.
    halt: watch::Sender<bool>,
    /// Peers this node currently suspects, for recovery events.
    suspected: Mutex<HashSet<Msid>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("identity", &self.identity)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Creates a coordinator and the receiving end of its event channel.
    pub fn new(
        store: Store,
        identity: NodeIdentity,
        config: ClusterConfig,
        delegates: DelegateRegistry,
    ) -> (Self, mpsc::Receiver<ClusterEvent>) {
        let config = Arc::new(config);
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let (halt, _) = watch::channel(false);

        let tables = Tables {
            membership: MembershipRegistry::new(store.clone()),
            peers: PeerLedger::new(store.clone()),
            ledger: CompensationLedger::new(store.clone()),
        };
        let locks = Arc::new(NamedLockManager::new(store.clone(), identity.msid, &config));
        let replay = ReplayWorker::new(
            tables.ledger.clone(),
            Arc::new(delegates),
            identity.msid,
            Arc::clone(&config),
            event_tx.clone(),
        );

        let coordinator = Self {
            identity,
            config,
            store,
            tables,
            locks,
            replay,
            event_tx,
            halt,
            suspected: Mutex::new(HashSet::new()),
        };
        (coordinator, event_rx)
    }

    /// Joins the cluster.
    ///
    /// Clears this node's stale observations, heartbeats, drops everyone's
    /// votes about older generations of this node, then deals with frames
    /// the previous generation left behind: replayed by default, or
    /// discarded when `discard_leftovers_on_start` is set.
    pub async fn start(&self) -> Result<StartupReport, ClusterError> {
        let msid = self.identity.msid;
        let runid = self.identity.runid;

        let cleared_observations = self.blocking(move |t| t.peers.clear_all(msid)).await?;
        let identity = self.identity.clone();
        let record = self
            .blocking(move |t| t.membership.heartbeat(&identity))
            .await?;
        let forgotten_observations = self
            .blocking(move |t| t.peers.forget_generations_before(msid, runid))
            .await?;

        let mut report = StartupReport {
            record,
            cleared_observations,
            forgotten_observations,
            recovered_frames: 0,
            discarded_frames: 0,
            replay: ReplayReport::default(),
        };

        if self.config.discard_leftovers_on_start {
            report.discarded_frames = self.blocking(move |t| t.ledger.clear(msid)).await?;
            if report.discarded_frames > 0 {
                warn!(%msid, frames = report.discarded_frames, "discarded leftover frames on start");
            }
        } else {
            report.recovered_frames = self.blocking(move |t| t.ledger.takeover(msid, msid)).await?;
            if report.recovered_frames > 0 {
                info!(%msid, frames = report.recovered_frames, "recovering own leftover frames");
            }
            report.replay = self.replay.drain(&self.halt.subscribe()).await?;
        }

        info!(
            %msid,
            %runid,
            name = %self.identity.name,
            address = %self.identity.service_address,
            "joined cluster"
        );
        Ok(report)
    }

    /// Runs one heartbeat and failure-detection cycle.
    ///
    /// A failed heartbeat is logged and skips the cycle. `Superseded` is
    /// returned as an error: a newer generation of this node exists and
    /// this one must stop.
    pub async fn tick(&self) -> Result<TickReport, ClusterError> {
        self.tick_with(&self.halt.subscribe()).await
    }

    async fn tick_with(&self, shutdown: &watch::Receiver<bool>) -> Result<TickReport, ClusterError> {
        let msid = self.identity.msid;
        let mut report = TickReport::default();

        let identity = self.identity.clone();
        match self.blocking(move |t| t.membership.heartbeat(&identity)).await {
            Ok(_) => report.heartbeat_ok = true,
            Err(e @ ClusterError::Superseded { .. }) => return Err(e),
            Err(e) => {
                warn!(%msid, error = %e, "heartbeat failed, skipping cycle");
                return Ok(report);
            }
        }

        let cutoff = self
            .store
            .now_ms()
            .saturating_sub(duration_ms(self.config.liveness_window()));
        let active = self.blocking(move |t| t.membership.active_nodes(cutoff)).await?;
        let inactive = self
            .blocking(move |t| t.membership.inactive_nodes(cutoff))
            .await?;
        report.active = active.len();

        for peer in inactive {
            if peer.msid == msid || peer.state == NodeState::Down {
                continue;
            }
            self.observe_inactive(&peer, report.active, cutoff, &mut report)
                .await?;
        }

        for peer in active.iter().filter(|p| p.msid != msid) {
            let (peer_msid, peer_runid) = (peer.msid, peer.runid);
            self.blocking(move |t| {
                t.peers
                    .set_observation(msid, peer_msid, peer_runid, PeerState::Up)
            })
            .await?;
            let was_suspected = self.suspected_set().remove(&peer_msid);
            if was_suspected {
                info!(peer = %peer_msid, runid = %peer_runid, "peer recovered");
                emit(
                    &self.event_tx,
                    ClusterEvent::NodeRecovered {
                        msid: peer_msid,
                        runid: peer_runid,
                    },
                )
                .await;
            }
        }

        report.replay = match self.replay.drain(shutdown).await {
            Ok(replay) => replay,
            Err(e) => {
                warn!(%msid, error = %e, "replay pass failed");
                ReplayReport::default()
            }
        };
        Ok(report)
    }

    /// Raises an alert against a silent peer, records this node's opinion
    /// and, on quorum, declares it down and takes its frames. The
    /// declaration rechecks the peer's generation and silence against
    /// `cutoff` in the same transaction as the takeover.
    async fn observe_inactive(
        &self,
        peer: &NodeRecord,
        active: usize,
        cutoff: i64,
        report: &mut TickReport,
    ) -> Result<(), ClusterError> {
        let msid = self.identity.msid;
        let (peer_msid, peer_runid) = (peer.msid, peer.runid);

        let alerts = self.blocking(move |t| t.membership.record_alert(peer_msid)).await?;
        let state = if alerts >= self.config.alerts_before_down {
            PeerState::Down
        } else {
            PeerState::Suspect
        };
        self.blocking(move |t| t.peers.set_observation(msid, peer_msid, peer_runid, state))
            .await?;
        report.suspected.push(peer_msid);

        let newly_suspected = self.suspected_set().insert(peer_msid);
        if newly_suspected {
            warn!(peer = %peer_msid, runid = %peer_runid, alerts, "peer missed heartbeats");
            emit(
                &self.event_tx,
                ClusterEvent::NodeSuspected {
                    msid: peer_msid,
                    runid: peer_runid,
                    alerts,
                },
            )
            .await;
        }

        if state != PeerState::Down {
            return Ok(());
        }

        let votes = self
            .blocking(move |t| t.peers.count_agreeing(peer_msid, peer_runid, PeerState::Down))
            .await?;
        let threshold = self.config.quorum.threshold(active);
        if !self.config.quorum.is_reached(votes, active) {
            debug!(peer = %peer_msid, votes, threshold, "waiting for down quorum");
            return Ok(());
        }

        let declared = self
            .blocking(move |t| t.membership.declare_down(peer_msid, peer_runid, cutoff, msid))
            .await?;
        let Some(moved) = declared else {
            return Ok(());
        };

        warn!(peer = %peer_msid, runid = %peer_runid, votes, threshold, "declared peer down");
        report.declared_down.push(peer_msid);
        emit(
            &self.event_tx,
            ClusterEvent::NodeDeclaredDown {
                msid: peer_msid,
                runid: peer_runid,
                votes,
                threshold,
            },
        )
        .await;
        if moved > 0 {
            report.frames_taken_over += moved;
            emit(
                &self.event_tx,
                ClusterEvent::FramesTakenOver {
                    from: peer_msid,
                    frames: moved,
                },
            )
            .await;
        }
        Ok(())
    }

    /// Ticks every heartbeat interval until `shutdown` flips to true (or
    /// its sender is dropped), or this generation is superseded.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick_with(&shutdown).await {
                        Ok(_) => {}
                        Err(e @ ClusterError::Superseded { .. }) => {
                            error!(error = %e, "stopping coordinator");
                            return;
                        }
                        Err(e) => warn!(error = %e, "cluster tick failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(msid = %self.identity.msid, "coordinator loop stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Runs [`Coordinator::run`] on its own task.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.run(shutdown).await })
    }

    /// Leaves the cluster gracefully: stops replay and retires this
    /// node's row so peers do not suspect it.
    pub async fn leave(&self) -> Result<bool, ClusterError> {
        self.halt.send_replace(true);
        let msid = self.identity.msid;
        let removed = self.blocking(move |t| t.membership.remove(msid)).await?;
        info!(%msid, "left cluster");
        Ok(removed)
    }

    /// A compensation stack for `ctx` owned by this node.
    pub fn scope(&self, ctx: ContextId) -> Result<CompensationScope, ClusterError> {
        CompensationScope::new(self.tables.ledger.clone(), self.identity.msid, ctx)
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn locks(&self) -> &Arc<NamedLockManager> {
        &self.locks
    }

    pub fn ledger(&self) -> &CompensationLedger {
        &self.tables.ledger
    }

    pub fn membership(&self) -> &MembershipRegistry {
        &self.tables.membership
    }

    pub fn peers(&self) -> &PeerLedger {
        &self.tables.peers
    }

    fn suspected_set(&self) -> std::sync::MutexGuard<'_, HashSet<Msid>> {
        self.suspected.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, ClusterError>
    where
        F: FnOnce(&Tables) -> Result<T, ClusterError> + Send + 'static,
        T: Send + 'static,
    {
        let tables = self.tables.clone();
        run_blocking(self.config.store_timeout(), move || f(&tables)).await
    }
}
