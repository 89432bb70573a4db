//! The sync controller.

use crate::catchup::{self, CatchUpReport};
use crate::config::SyncConfig;
use crate::context::{Notice, SyncContext, SyncStats};
use crate::drain::{DrainLoop, DrainReport};
use crate::error::{SyncError, SyncResult};
use crate::inbound::RemoteToLocal;
use crate::outbound::LocalToRemote;
use crate::store::{LocalFileSystem, RemoteStore, StateStore};
use mirrorsync_protocol::{ChangeEvent, PendingAction};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No event processing is running.
    Stopped,
    /// Subscribed to both stores and syncing.
    Running,
}

/// Outcome of one sync round.
#[derive(Debug, Clone, Default)]
pub struct RoundReport {
    /// Catch-up results, if the round ran one.
    pub catch_up: Option<CatchUpReport>,
    /// Drain results.
    pub drain: DrainReport,
    /// Deferred remote changes re-reconciled after the drain.
    pub deferred: usize,
    /// Whether the catch-up watermark advanced.
    pub watermark_advanced: bool,
}

#[derive(Clone)]
struct Workers {
    ctx: Arc<SyncContext>,
    outbound: Arc<LocalToRemote>,
    inbound: Arc<RemoteToLocal>,
    drain: Arc<DrainLoop>,
}

impl Workers {
    /// Catch-up if asked, then drain, then deferred remote changes.
    async fn round(&self, catch_up: bool) -> SyncResult<RoundReport> {
        let mut report = RoundReport::default();
        let mut clean = true;
        if catch_up {
            let caught = catchup::run(&self.ctx, &self.inbound, &self.outbound).await?;
            clean &= caught.errors == 0;
            report.catch_up = Some(caught);
        }

        report.drain = self.drain.drain_with_retry().await?;
        clean &= report.drain.is_clean();
        report.deferred = self.inbound.retry_deferred().await?;
        clean &= !self.ctx.has_deferred();

        let watermark = report.catch_up.as_ref().map(|c| c.started_at);
        if let Some(at) = watermark.filter(|_| clean) {
            self.ctx.state.set_last_synced_at(at).await?;
            report.watermark_advanced = true;
        }
        Ok(report)
    }
}

struct Lifecycle {
    state: RwLock<EngineState>,
    shutdown: watch::Sender<bool>,
}

impl Lifecycle {
    /// Reports a handler error; storage failures stop the engine.
    fn report(&self, ctx: &SyncContext, what: &str, err: SyncError) {
        if err.is_fatal() {
            error!(error = %err, "{what} hit a state storage failure; stopping");
            ctx.record(|s| s.last_error = Some(err.to_string()));
            ctx.notify(Notice::Fatal {
                error: err.to_string(),
            });
            ctx.cancel();
            self.shutdown.send_replace(true);
            *self.state.write() = EngineState::Stopped;
        } else if !matches!(err, SyncError::Cancelled) {
            warn!(error = %err, "{what} failed");
            ctx.record(|s| s.last_error = Some(err.to_string()));
        }
    }
}

/// An offline-first sync engine between a local tree and a remote asset
/// store.
///
/// # Example
///
/// ```rust,ignore
/// let engine = SyncEngine::new(SyncConfig::default(), local, remote, state).await?;
/// let mut notices = engine.notices();
/// engine.start().await?;
/// // ...
/// engine.stop().await?;
/// ```
pub struct SyncEngine {
    workers: Workers,
    lifecycle: Arc<Lifecycle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Creates an engine, loading pending actions from `state`.
    pub async fn new(
        config: SyncConfig,
        local: Arc<dyn LocalFileSystem>,
        remote: Arc<dyn RemoteStore>,
        state: Arc<dyn StateStore>,
    ) -> SyncResult<Self> {
        let ctx = Arc::new(SyncContext::new(config, local, remote, state).await?);
        let outbound = Arc::new(LocalToRemote::new(ctx.clone()));
        let inbound = Arc::new(RemoteToLocal::new(ctx.clone()));
        let drain = Arc::new(DrainLoop::new(ctx.clone(), outbound.clone()));
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            workers: Workers {
                ctx,
                outbound,
                inbound,
                drain,
            },
            lifecycle: Arc::new(Lifecycle {
                state: RwLock::new(EngineState::Stopped),
                shutdown,
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.lifecycle.state.read()
    }

    /// Returns activity statistics.
    pub fn stats(&self) -> SyncStats {
        self.workers.ctx.stats()
    }

    /// Subscribes to conflict, failure and shutdown notices.
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.workers.ctx.subscribe_notices()
    }

    /// Returns the pending actions in replay order.
    pub async fn pending_actions(&self) -> Vec<PendingAction> {
        self.workers.ctx.queue.snapshot().await
    }

    /// Subscribes to both stores and starts syncing.
    ///
    /// If the remote store is connected, a first round runs right away,
    /// with a catch-up if [`SyncConfig::catch_up_on_start`] is set.
    pub async fn start(&self) -> SyncResult<()> {
        {
            let mut state = self.lifecycle.state.write();
            if *state == EngineState::Running {
                return Err(SyncError::InvalidStateTransition {
                    from: format!("{:?}", EngineState::Running),
                    to: format!("{:?}", EngineState::Running),
                });
            }
            *state = EngineState::Running;
        }
        // Tasks left over from a fatal stop.
        self.join_tasks().await;

        let ctx = &self.workers.ctx;
        ctx.reset_cancel();
        self.lifecycle.shutdown.send_replace(false);

        let local_events = ctx.local.subscribe();
        let remote_events = ctx.remote.subscribe();
        let connectivity = ctx.remote.connectivity();

        let tasks = vec![
            tokio::spawn(pump_local(
                self.workers.clone(),
                self.lifecycle.clone(),
                local_events,
            )),
            tokio::spawn(pump_remote(
                self.workers.clone(),
                self.lifecycle.clone(),
                remote_events,
            )),
            tokio::spawn(watch_connectivity(
                self.workers.clone(),
                self.lifecycle.clone(),
                connectivity,
            )),
        ];
        self.tasks.lock().extend(tasks);
        info!("sync engine started");
        Ok(())
    }

    /// Stops syncing and waits for in-flight work to wind down.
    ///
    /// Pending actions stay queued. Stopping a stopped engine is a no-op.
    pub async fn stop(&self) -> SyncResult<()> {
        self.workers.ctx.cancel();
        self.lifecycle.shutdown.send_replace(true);
        self.join_tasks().await;
        let was = std::mem::replace(&mut *self.lifecycle.state.write(), EngineState::Stopped);
        if was == EngineState::Running {
            info!("sync engine stopped");
        }
        Ok(())
    }

    /// Handles a local change event directly, bypassing the subscription.
    pub async fn handle_local_event(&self, event: ChangeEvent) -> SyncResult<()> {
        self.workers.outbound.handle(event).await
    }

    /// Handles a remote change event directly, bypassing the subscription.
    pub async fn handle_remote_event(&self, event: ChangeEvent) -> SyncResult<()> {
        self.workers.inbound.handle(event).await
    }

    /// Runs one drain pass, then re-reconciles deferred remote changes.
    pub async fn drain_now(&self) -> SyncResult<DrainReport> {
        let report = self.workers.drain.run_pass().await?;
        self.workers.inbound.retry_deferred().await?;
        Ok(report)
    }

    /// Runs a full round: catch-up, drain with retry, deferred changes.
    pub async fn sync_now(&self) -> SyncResult<RoundReport> {
        self.workers.round(true).await
    }

    async fn join_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "sync task ended abnormally");
            }
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.workers.ctx.cancel();
        self.lifecycle.shutdown.send_replace(true);
    }
}

async fn pump_local(
    workers: Workers,
    lifecycle: Arc<Lifecycle>,
    mut events: mpsc::UnboundedReceiver<ChangeEvent>,
) {
    let mut shutdown = lifecycle.shutdown.subscribe();
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => {}
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("local event stream closed");
                    break;
                };
                if let Err(e) = workers.outbound.handle(event).await {
                    lifecycle.report(&workers.ctx, "local event", e);
                }
            }
        }
    }
}

async fn pump_remote(
    workers: Workers,
    lifecycle: Arc<Lifecycle>,
    mut events: mpsc::UnboundedReceiver<ChangeEvent>,
) {
    let mut shutdown = lifecycle.shutdown.subscribe();
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => {}
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("remote event stream closed");
                    break;
                };
                if let Err(e) = workers.inbound.handle(event).await {
                    lifecycle.report(&workers.ctx, "remote event", e);
                }
            }
        }
    }
}

/// Runs sync rounds on start, on reconnect and when handlers queue work
/// while the remote store is reachable.
async fn watch_connectivity(
    workers: Workers,
    lifecycle: Arc<Lifecycle>,
    mut connectivity: watch::Receiver<bool>,
) {
    let mut shutdown = lifecycle.shutdown.subscribe();
    if *connectivity.borrow_and_update() {
        let catch_up = workers.ctx.config.catch_up_on_start;
        run_round(&workers, &lifecycle, catch_up).await;
    }

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => {}
            changed = connectivity.changed() => {
                if changed.is_err() {
                    debug!("connectivity watch closed");
                    break;
                }
                if *connectivity.borrow_and_update() {
                    info!("remote store reachable; catching up");
                    run_round(&workers, &lifecycle, true).await;
                } else {
                    info!("remote store unreachable; queueing local changes");
                }
            }
            _ = workers.ctx.drain_requested().notified() => {
                if workers.ctx.remote.is_connected() {
                    run_round(&workers, &lifecycle, false).await;
                }
            }
        }
    }
}

async fn run_round(workers: &Workers, lifecycle: &Lifecycle, catch_up: bool) {
    match workers.round(catch_up).await {
        Ok(report) => debug!(
            applied = report.drain.applied,
            remaining = report.drain.remaining,
            watermark_advanced = report.watermark_advanced,
            "sync round finished"
        ),
        Err(e) => lifecycle.report(&workers.ctx, "sync round", e),
    }
}
