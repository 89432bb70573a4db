//! State shared by the handlers, the drain loop and the controller.

use crate::config::SyncConfig;
use crate::echo::EchoGuard;
use crate::error::{ignore_not_found, SyncError, SyncResult};
use crate::queue::ActionQueue;
use crate::store::{LocalFileSystem, RemoteStore, StateStore};
use mirrorsync_protocol::{
    resolve_conflict, ActionId, AssetId, ConflictInput, ConflictNotice, ConflictOutcome, Link,
    LocalFileRecord, PendingAction, RemoteAssetRecord, Resolution, SideEffect, Timestamp,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tracing::warn;

/// A signal for the presentation layer.
#[derive(Debug, Clone)]
pub enum Notice {
    /// Both sides diverged and a decision was taken.
    Conflict(ConflictNotice),
    /// A queued action could never succeed and was dropped.
    MalformedAction {
        /// The dropped action.
        id: ActionId,
        /// What was wrong with it.
        reason: String,
    },
    /// A queued action keeps failing.
    ActionFailing {
        /// The failing action.
        action: PendingAction,
        /// Failed attempts so far.
        attempts: u32,
        /// The last error.
        error: String,
    },
    /// The engine stopped because its state storage failed.
    Fatal {
        /// The storage error.
        error: String,
    },
}

/// Statistics about sync activity.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Change events handled, from either side.
    pub events_handled: u64,
    /// Events turned into queued actions.
    pub actions_enqueued: u64,
    /// Queued actions applied by the drain loop.
    pub actions_applied: u64,
    /// Failed attempts to apply queued actions.
    pub actions_failed: u64,
    /// Local events recognized as echoes of the engine's own writes.
    pub echoes_suppressed: u64,
    /// Conflicts decided in favour of the remote side.
    pub conflicts: u64,
    /// Completed drain passes.
    pub drain_passes: u64,
    /// When the last drain pass finished.
    pub last_drain_at: Option<Timestamp>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// How a divergence between a local file and a remote asset was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    /// The local version should be pushed.
    LocalWins,
    /// The remote version overwrote the local file.
    RemoteWon,
    /// Both sides already held the same bytes; the pair was relinked.
    Identical,
    /// The asset disappeared while settling.
    RemoteGone,
}

pub(crate) struct SyncContext {
    pub(crate) config: SyncConfig,
    pub(crate) local: Arc<dyn LocalFileSystem>,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) state: Arc<dyn StateStore>,
    pub(crate) queue: ActionQueue,
    pub(crate) echo: EchoGuard,
    notices: broadcast::Sender<Notice>,
    stats: RwLock<SyncStats>,
    cancelled: AtomicBool,
    drain_requested: Notify,
    deferred: Mutex<BTreeSet<AssetId>>,
}

impl SyncContext {
    pub(crate) async fn new(
        config: SyncConfig,
        local: Arc<dyn LocalFileSystem>,
        remote: Arc<dyn RemoteStore>,
        state: Arc<dyn StateStore>,
    ) -> SyncResult<Self> {
        let queue = ActionQueue::open(state.clone()).await?;
        let (notices, _) = broadcast::channel(config.notice_capacity);
        Ok(Self {
            echo: EchoGuard::new(config.echo_window),
            config,
            local,
            remote,
            state,
            queue,
            notices,
            stats: RwLock::new(SyncStats::default()),
            cancelled: AtomicBool::new(false),
            drain_requested: Notify::new(),
            deferred: Mutex::new(BTreeSet::new()),
        })
    }

    pub(crate) fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub(crate) fn notify(&self, notice: Notice) {
        // No receivers is fine: notices are informational.
        let _ = self.notices.send(notice);
    }

    pub(crate) fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    pub(crate) fn record(&self, update: impl FnOnce(&mut SyncStats)) {
        update(&mut self.stats.write());
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn check_cancelled(&self) -> SyncResult<()> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Asks the controller for a drain pass.
    pub(crate) fn request_drain(&self) {
        self.drain_requested.notify_one();
    }

    pub(crate) fn drain_requested(&self) -> &Notify {
        &self.drain_requested
    }

    /// Parks a remote change until pending local intents are replayed.
    pub(crate) fn defer(&self, id: AssetId) {
        self.deferred.lock().insert(id);
    }

    pub(crate) fn take_deferred(&self) -> Vec<AssetId> {
        std::mem::take(&mut *self.deferred.lock()).into_iter().collect()
    }

    pub(crate) fn has_deferred(&self) -> bool {
        !self.deferred.lock().is_empty()
    }

    /// Records that `file` and `asset` hold the same content.
    pub(crate) async fn link_pair(
        &self,
        file: &LocalFileRecord,
        asset: &RemoteAssetRecord,
    ) -> SyncResult<()> {
        let link = Link::new(
            file.inode.clone(),
            asset.id.clone(),
            file.path.clone(),
            asset.updated_at,
            file.modified_at,
        );
        self.state.link(&link).await
    }

    /// Writes remote bytes to `path` through the echo guard and links the pair.
    pub(crate) async fn write_local(
        &self,
        path: &str,
        asset: &RemoteAssetRecord,
        data: Vec<u8>,
    ) -> SyncResult<LocalFileRecord> {
        self.echo.expect_write(path, &data);
        let record = self
            .local
            .write_file(path, data)
            .await
            .map_err(|e| SyncError::destination("write", path, e))?;
        self.link_pair(&record, asset).await?;
        Ok(record)
    }

    /// Downloads `asset` and writes it to `path`.
    ///
    /// Returns `None` if the asset disappeared in the meantime.
    pub(crate) async fn download_to(
        &self,
        path: &str,
        asset: &RemoteAssetRecord,
    ) -> SyncResult<Option<LocalFileRecord>> {
        let download = self.remote.download_asset(&asset.id).await;
        let Some(data) = ignore_not_found(download)
            .map_err(|e| SyncError::destination("download", &asset.path, e))?
        else {
            return Ok(None);
        };
        self.write_local(path, asset, data).await.map(Some)
    }

    /// Settles a file and an asset that both changed since they were last
    /// in sync.
    pub(crate) async fn settle(
        &self,
        file: &LocalFileRecord,
        local_data: &[u8],
        asset: &RemoteAssetRecord,
    ) -> SyncResult<Settlement> {
        let input = ConflictInput {
            path: file.path.clone(),
            local_time: self.config.local_timestamp.of(file),
            remote_updated_at: asset.updated_at,
        };
        let resolution = resolve_conflict(&input);
        if resolution.outcome == ConflictOutcome::LocalWins {
            return Ok(Settlement::LocalWins);
        }

        let download = self.remote.download_asset(&asset.id).await;
        let Some(remote_data) = ignore_not_found(download)
            .map_err(|e| SyncError::destination("download", &asset.path, e))?
        else {
            return Ok(Settlement::RemoteGone);
        };
        if remote_data == local_data {
            self.link_pair(file, asset).await?;
            return Ok(Settlement::Identical);
        }

        let mut remote_data = Some(remote_data);
        for effect in &resolution.effects {
            match effect {
                SideEffect::OverwriteLocal => {
                    if let Some(data) = remote_data.take() {
                        self.write_local(&file.path, asset, data).await?;
                    }
                }
                SideEffect::NotifyConflict => self.report_conflict(&input, &resolution),
                SideEffect::PushLocal => {}
            }
        }
        Ok(Settlement::RemoteWon)
    }

    fn report_conflict(&self, input: &ConflictInput, resolution: &Resolution) {
        warn!(
            path = %input.path,
            local_time = %input.local_time,
            remote_updated_at = %input.remote_updated_at,
            "conflict resolved in favour of the remote version"
        );
        self.record(|s| s.conflicts += 1);
        self.notify(Notice::Conflict(ConflictNotice::new(input, resolution)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryFileSystem, MemoryRemoteStore, MemoryStateStore};

    struct Fixture {
        local: Arc<MemoryFileSystem>,
        remote: Arc<MemoryRemoteStore>,
        state: Arc<MemoryStateStore>,
        ctx: SyncContext,
    }

    async fn fixture() -> Fixture {
        let local = Arc::new(MemoryFileSystem::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        let state = Arc::new(MemoryStateStore::new());
        let ctx = SyncContext::new(
            SyncConfig::default(),
            local.clone(),
            remote.clone(),
            state.clone(),
        )
        .await
        .unwrap();
        Fixture {
            local,
            remote,
            state,
            ctx,
        }
    }

    #[tokio::test]
    async fn settle_relinks_identical_content() {
        let f = fixture().await;
        let mut notices = f.ctx.subscribe_notices();
        let file = f.local.put("a", b"same");
        let asset = f.remote.put_external("a", b"same");

        let settled = f.ctx.settle(&file, b"same", &asset).await.unwrap();
        assert_eq!(settled, Settlement::Identical);
        let link = f.state.link_for_inode(&file.inode).await.unwrap().unwrap();
        assert_eq!(link.asset_id, asset.id);
        assert_eq!(f.ctx.stats().conflicts, 0);
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn settle_reports_vanished_asset() {
        let f = fixture().await;
        let file = f.local.put("a", b"local");
        let asset = f.remote.put_external("a", b"remote");
        f.remote.delete_external("a");

        let settled = f.ctx.settle(&file, b"local", &asset).await.unwrap();
        assert_eq!(settled, Settlement::RemoteGone);
        assert_eq!(f.local.contents().get("a").unwrap(), b"local");
        assert!(f.state.links().is_empty());
    }

    #[tokio::test]
    async fn settle_newer_remote_overwrites_and_notifies() {
        let f = fixture().await;
        let mut notices = f.ctx.subscribe_notices();
        let file = f.local.put("a", b"local");
        let asset = f.remote.put_external("a", b"remote");

        let settled = f.ctx.settle(&file, b"local", &asset).await.unwrap();
        assert_eq!(settled, Settlement::RemoteWon);
        assert_eq!(f.local.contents().get("a").unwrap(), b"remote");
        assert!(f.ctx.echo.is_write_echo("a", b"remote"));
        assert!(matches!(notices.try_recv().unwrap(), Notice::Conflict(c) if c.path == "a"));
        assert_eq!(f.ctx.stats().conflicts, 1);
    }

    #[tokio::test]
    async fn settle_newer_local_wins_without_download() {
        let f = fixture().await;
        let asset = f.remote.put_external("a", b"remote");
        let file = f.local.put("a", b"local");

        let settled = f.ctx.settle(&file, b"local", &asset).await.unwrap();
        assert_eq!(settled, Settlement::LocalWins);
        assert_eq!(f.local.contents().get("a").unwrap(), b"local");
        assert!(f.state.links().is_empty());
    }

    #[tokio::test]
    async fn deferred_ids_are_taken_once() {
        let f = fixture().await;
        f.ctx.defer(AssetId::new("asset-1"));
        f.ctx.defer(AssetId::new("asset-1"));
        assert!(f.ctx.has_deferred());
        assert_eq!(f.ctx.take_deferred(), vec![AssetId::new("asset-1")]);
        assert!(!f.ctx.has_deferred());
    }
}
