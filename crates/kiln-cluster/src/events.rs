//! Notifications the coordinator publishes to the embedding process.

use tokio::sync::mpsc;
use tracing::warn;

use crate::identity::{ContextId, Msid, RunId};

/// Something the rest of the process may want to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A peer missed enough heartbeats that this node now suspects it.
    NodeSuspected { msid: Msid, runid: RunId, alerts: u32 },

    /// A peer this node had suspected is heartbeating again.
    NodeRecovered { msid: Msid, runid: RunId },

    /// Enough observers agree the peer generation is dead.
    NodeDeclaredDown {
        msid: Msid,
        runid: RunId,
        votes: usize,
        threshold: usize,
    },

    /// This node now owns a dead node's compensation frames.
    FramesTakenOver { from: Msid, frames: usize },

    /// A frame keeps failing to replay and needs an operator.
    ReplayStalled {
        frame_id: i64,
        origin_msid: Msid,
        origin_context: ContextId,
        delegate: String,
        attempts: u32,
        last_error: String,
    },
}

/// Sends `event`, dropping it with a warning if nobody is listening.
pub(crate) async fn emit(tx: &mpsc::Sender<ClusterEvent>, event: ClusterEvent) {
    if tx.send(event).await.is_err() {
        warn!("cluster event channel closed, dropping event");
    }
}
