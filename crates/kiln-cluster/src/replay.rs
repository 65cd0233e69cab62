//! Replay of orphaned compensation frames.
//!
//! After a takeover the new owner holds the dead node's frames under the
//! orphan context. The replay worker runs them through registered
//! delegates: per original stack, newest frame first, and never an older
//! frame before every newer one in its stack has succeeded. A failed frame
//! stays in the ledger with its attempt count bumped and is retried on a
//! later pass once its backoff has elapsed.
//!
//! Delegates may run more than once for the same frame (a node can die
//! between a delegate succeeding and the frame being deleted), so they
//! must be idempotent.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use kiln_store::{duration_ms, run_blocking};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;
use crate::events::{emit, ClusterEvent};
use crate::identity::Msid;
use crate::ledger::{CompensationFrame, CompensationLedger};
use crate::ClusterError;

/// Failure reported by a compensation delegate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct DelegateError {
    pub message: String,
    /// False when retrying cannot help; the frame is flagged to an
    /// operator straight away instead of after the usual attempts.
    pub retryable: bool,
}

impl DelegateError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

pub type DelegateFuture = Pin<Box<dyn Future<Output = Result<(), DelegateError>> + Send>>;

/// An action that undoes one recorded step.
///
/// Implemented for any `Fn(CompensationFrame) -> impl Future` closure.
pub trait CompensationDelegate: Send + Sync + 'static {
    fn compensate(&self, frame: CompensationFrame) -> DelegateFuture;
}

impl<F, Fut> CompensationDelegate for F
where
    F: Fn(CompensationFrame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DelegateError>> + Send + 'static,
{
    fn compensate(&self, frame: CompensationFrame) -> DelegateFuture {
        Box::pin(self(frame))
    }
}

/// Maps delegate names stored in frames to the code that runs them.
///
/// Filled in by the embedding process before the coordinator starts.
/// Nothing here is persisted.
#[derive(Clone, Default)]
pub struct DelegateRegistry {
    delegates: HashMap<String, Arc<dyn CompensationDelegate>>,
}

impl std::fmt::Debug for DelegateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.delegates.keys().collect();
        names.sort();
        f.debug_struct("DelegateRegistry")
            .field("delegates", &names)
            .finish()
    }
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `delegate` under `name`, replacing any previous one.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        delegate: impl CompensationDelegate,
    ) -> &mut Self {
        self.delegates.insert(name.into(), Arc::new(delegate));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CompensationDelegate>> {
        self.delegates.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.delegates.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.delegates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delegates.is_empty()
    }
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Frames whose delegate succeeded and that were deleted.
    pub replayed: usize,
    /// Frames whose delegate failed this pass.
    pub failed: usize,
    /// Frames skipped because their stack is waiting out a retry backoff.
    pub deferred: usize,
    /// Failures that raised an operator alert.
    pub stalled: usize,
}

impl ReplayReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Runs this node's claimable frames.
#[derive(Clone)]
pub struct ReplayWorker {
    ledger: CompensationLedger,
    delegates: Arc<DelegateRegistry>,
    msid: Msid,
    config: Arc<ClusterConfig>,
    event_tx: mpsc::Sender<ClusterEvent>,
}

impl std::fmt::Debug for ReplayWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayWorker")
            .field("msid", &self.msid)
            .field("delegates", &self.delegates)
            .finish_non_exhaustive()
    }
}

impl ReplayWorker {
    pub fn new(
        ledger: CompensationLedger,
        delegates: Arc<DelegateRegistry>,
        msid: Msid,
        config: Arc<ClusterConfig>,
        event_tx: mpsc::Sender<ClusterEvent>,
    ) -> Self {
        Self {
            ledger,
            delegates,
            msid,
            config,
            event_tx,
        }
    }

    /// One pass over every claimable frame.
    ///
    /// `shutdown` is checked before each frame; once it reads `true` the
    /// pass stops and reports what it did so far. A delegate already
    /// running is allowed to finish.
    pub async fn drain(&self, shutdown: &watch::Receiver<bool>) -> Result<ReplayReport, ClusterError> {
        let msid = self.msid;
        let frames = self.store_call(move |ledger| ledger.claimable(msid)).await?;
        let mut report = ReplayReport::default();
        if frames.is_empty() {
            return Ok(report);
        }

        let now = self.ledger.now_ms();
        for group in frames.chunk_by(|a, b| a.origin() == b.origin()) {
            for (i, frame) in group.iter().enumerate() {
                if *shutdown.borrow() {
                    debug!(%msid, "replay interrupted by shutdown");
                    return Ok(report);
                }
                if self.backing_off(frame, now) {
                    report.deferred += group.len() - i;
                    break;
                }

                let id = frame.id;
                match self.invoke(frame).await {
                    Ok(()) => {
                        if self.store_call(move |ledger| ledger.complete(id, msid)).await? {
                            report.replayed += 1;
                            debug!(
                                id,
                                delegate = %frame.delegate,
                                origin = %frame.origin_msid,
                                context = %frame.origin_context,
                                seq = frame.seq,
                                "replayed compensation frame"
                            );
                        } else {
                            debug!(id, "frame changed owner during replay");
                            break;
                        }
                    }
                    Err(err) => {
                        report.failed += 1;
                        if self.fail(frame, &err).await? {
                            report.stalled += 1;
                        }
                        break;
                    }
                }
            }
        }

        if !report.is_idle() {
            info!(
                %msid,
                replayed = report.replayed,
                failed = report.failed,
                deferred = report.deferred,
                stalled = report.stalled,
                "replay pass finished"
            );
        }
        Ok(report)
    }

    /// Records a failure and raises the stall alert when due. Returns
    /// whether the alert was raised.
    async fn fail(&self, frame: &CompensationFrame, err: &DelegateError) -> Result<bool, ClusterError> {
        let (id, msid, message) = (frame.id, self.msid, err.message.clone());
        let attempts = self
            .store_call(move |ledger| ledger.record_failure(id, msid, &message))
            .await?;
        if attempts == 0 {
            debug!(id, "frame changed owner during replay");
            return Ok(false);
        }
        warn!(
            id,
            delegate = %frame.delegate,
            attempts,
            error = %err,
            "compensation delegate failed"
        );

        if attempts < self.config.replay_max_attempts && err.retryable {
            return Ok(false);
        }
        error!(
            id,
            delegate = %frame.delegate,
            origin = %frame.origin_msid,
            context = %frame.origin_context,
            attempts,
            error = %err,
            "compensation frame stalled, operator attention required"
        );
        emit(
            &self.event_tx,
            ClusterEvent::ReplayStalled {
                frame_id: id,
                origin_msid: frame.origin_msid,
                origin_context: frame.origin_context,
                delegate: frame.delegate.clone(),
                attempts,
                last_error: err.message.clone(),
            },
        )
        .await;
        Ok(true)
    }

    /// Runs the frame's delegate on its own task, bounded by the delegate
    /// timeout. A panic or timeout counts as a retryable failure.
    async fn invoke(&self, frame: &CompensationFrame) -> Result<(), DelegateError> {
        let Some(delegate) = self.delegates.get(&frame.delegate) else {
            return Err(DelegateError::retryable(format!(
                "no delegate registered for '{}'",
                frame.delegate
            )));
        };

        let timeout = self.config.delegate_timeout();
        let mut task = tokio::spawn(delegate.compensate(frame.clone()));
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(DelegateError::retryable(format!("delegate task failed: {join}"))),
            Err(_) => {
                task.abort();
                Err(DelegateError::retryable(format!(
                    "delegate timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    fn backing_off(&self, frame: &CompensationFrame, now: i64) -> bool {
        frame.last_attempt_at.is_some_and(|at| {
            now < at.saturating_add(duration_ms(self.config.replay_backoff(frame.attempts)))
        })
    }

    async fn store_call<T, F>(&self, f: F) -> Result<T, ClusterError>
    where
        F: FnOnce(&CompensationLedger) -> Result<T, ClusterError> + Send + 'static,
        T: Send + 'static,
    {
        let ledger = self.ledger.clone();
        run_blocking(self.config.store_timeout(), move || f(&ledger)).await
    }
}
