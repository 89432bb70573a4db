//! Replay of queued actions.

use crate::context::{Notice, SyncContext};
use crate::error::{SyncError, SyncResult};
use crate::outbound::LocalToRemote;
use mirrorsync_protocol::{ActionId, Timestamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A queued action that failed during a drain pass and stays queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAction {
    /// The action.
    pub id: ActionId,
    /// Failed attempts so far.
    pub attempts: u32,
    /// The last error.
    pub error: String,
}

/// Outcome of draining the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Actions applied and removed.
    pub applied: usize,
    /// Actions that failed and stay queued.
    pub failed: Vec<FailedAction>,
    /// Malformed actions that were dropped.
    pub malformed: Vec<ActionId>,
    /// Actions not attempted because the pass stopped early.
    pub skipped_offline: usize,
    /// Actions left in the queue afterwards.
    pub remaining: usize,
    /// Whether the pass stopped on disconnect or cancellation.
    pub interrupted: bool,
}

impl DrainReport {
    /// Returns true if the queue was drained completely.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && !self.interrupted && self.remaining == 0
    }

    /// Folds a later pass into this report.
    fn absorb(&mut self, next: DrainReport) {
        self.applied += next.applied;
        self.malformed.extend(next.malformed);
        self.failed = next.failed;
        self.skipped_offline = next.skipped_offline;
        self.remaining = next.remaining;
        self.interrupted = next.interrupted;
    }
}

/// Drains the action queue through the outbound handler.
///
/// Only one pass runs at a time. Each action is applied with the queue
/// locked, so a concurrent enqueue cannot compact it away mid-flight.
pub(crate) struct DrainLoop {
    ctx: Arc<SyncContext>,
    outbound: Arc<LocalToRemote>,
    pass: tokio::sync::Mutex<()>,
    attempts: Mutex<HashMap<ActionId, u32>>,
}

impl DrainLoop {
    pub(crate) fn new(ctx: Arc<SyncContext>, outbound: Arc<LocalToRemote>) -> Self {
        Self {
            ctx,
            outbound,
            pass: tokio::sync::Mutex::new(()),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Runs a single pass over the queue in FIFO order.
    ///
    /// A failed action stays queued and the pass moves on. The pass stops
    /// early if the remote store goes away or the engine is stopping.
    pub(crate) async fn run_pass(&self) -> SyncResult<DrainReport> {
        let _pass = self.pass.lock().await;
        let snapshot = self.ctx.queue.snapshot().await;
        // Forget counts for actions compaction removed since the last pass.
        self.attempts
            .lock()
            .retain(|id, _| snapshot.iter().any(|a| a.id == *id));
        let mut report = DrainReport::default();
        if !snapshot.is_empty() {
            info!(pending = snapshot.len(), "drain pass started");
        }

        for (index, queued) in snapshot.iter().enumerate() {
            if self.ctx.is_cancelled() || !self.ctx.remote.is_connected() {
                report.interrupted = true;
                report.skipped_offline = snapshot.len() - index;
                break;
            }

            let mut queue = self.ctx.queue.lock().await;
            // Compaction may have rewritten or dropped it since the snapshot.
            let Some(action) = queue.get(queued.id).cloned() else {
                continue;
            };

            match self.outbound.apply_action(&action).await {
                Ok(()) => {
                    queue.remove(action.id).await?;
                    self.attempts.lock().remove(&action.id);
                    report.applied += 1;
                }
                Err(SyncError::MalformedAction { reason, .. }) => {
                    warn!(action_id = %action.id, reason = %reason, "dropping malformed action");
                    queue.remove(action.id).await?;
                    self.attempts.lock().remove(&action.id);
                    self.ctx.notify(Notice::MalformedAction {
                        id: action.id,
                        reason,
                    });
                    report.malformed.push(action.id);
                }
                Err(e) if e.is_fatal() => {
                    error!(action_id = %action.id, error = %e, "state storage failed during drain");
                    return Err(e);
                }
                Err(e) if e.is_unreachable() => {
                    debug!(action_id = %action.id, "remote store went away mid-pass");
                    report.interrupted = true;
                    report.skipped_offline = snapshot.len() - index;
                    break;
                }
                Err(e) => {
                    let attempts = {
                        let mut counts = self.attempts.lock();
                        let count = counts.entry(action.id).or_insert(0);
                        *count += 1;
                        *count
                    };
                    warn!(action_id = %action.id, action = %action, attempts, error = %e, "action failed; keeping it queued");
                    if attempts == self.ctx.config.retry.max_attempts {
                        self.ctx.notify(Notice::ActionFailing {
                            action: action.clone(),
                            attempts,
                            error: e.to_string(),
                        });
                    }
                    self.ctx.record(|s| s.last_error = Some(e.to_string()));
                    report.failed.push(FailedAction {
                        id: action.id,
                        attempts,
                        error: e.to_string(),
                    });
                }
            }
        }

        report.remaining = self.ctx.queue.len().await;
        self.ctx.record(|s| {
            s.drain_passes += 1;
            s.actions_applied += report.applied as u64;
            s.actions_failed += report.failed.len() as u64;
            s.last_drain_at = Some(Timestamp::now());
        });
        if !snapshot.is_empty() {
            info!(
                applied = report.applied,
                failed = report.failed.len(),
                malformed = report.malformed.len(),
                remaining = report.remaining,
                interrupted = report.interrupted,
                "drain pass finished"
            );
        }
        Ok(report)
    }

    /// Runs passes until the queue is clean, backing off between passes
    /// that left failures behind.
    pub(crate) async fn drain_with_retry(&self) -> SyncResult<DrainReport> {
        let retry = &self.ctx.config.retry;
        let mut report = self.run_pass().await?;

        let mut attempt = 1;
        while !report.failed.is_empty() && !report.interrupted && attempt < retry.max_attempts {
            let delay = retry.delay_for_attempt(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying failed actions");
            tokio::time::sleep(delay).await;

            if self.ctx.is_cancelled() || !self.ctx.remote.is_connected() {
                report.interrupted = true;
                break;
            }
            report.absorb(self.run_pass().await?);
            attempt += 1;
        }
        Ok(report)
    }
}
