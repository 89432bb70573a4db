//! Remote-to-local direction handler.

use crate::context::{Settlement, SyncContext};
use crate::error::{ignore_not_found, SyncError, SyncResult};
use mirrorsync_protocol::{
    AssetId, ChangeEvent, ChangeKind, Link, LocalFileRecord, ObjectRef, ProtocolError,
    RemoteAssetRecord,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Applies remote changes to the local tree.
///
/// Remote changes to a path with pending local actions are deferred until
/// those actions have been replayed, so the drain loop never races a
/// download for the same file.
pub(crate) struct RemoteToLocal {
    ctx: Arc<SyncContext>,
}

impl RemoteToLocal {
    pub(crate) fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Handles one remote change event.
    pub(crate) async fn handle(&self, event: ChangeEvent) -> SyncResult<()> {
        event.validate()?;
        let Some(asset) = event.source.as_remote() else {
            return Err(ProtocolError::MalformedEvent(format!(
                "local event for {} routed to the remote handler",
                event.path()
            ))
            .into());
        };
        self.ctx.record(|s| s.events_handled += 1);
        debug!(kind = ?event.kind, path = %asset.path, asset_id = %asset.id, "remote change");

        match event.kind {
            ChangeKind::Created | ChangeKind::Updated => self.reconcile(asset, None).await,
            ChangeKind::Deleted => self.on_deleted(&asset.id).await,
            ChangeKind::Moved => {
                let target = event
                    .target
                    .as_ref()
                    .and_then(ObjectRef::as_remote)
                    .ok_or_else(|| {
                        ProtocolError::MalformedEvent(format!("moved event for {} has no target", asset.path))
                    })?;
                self.reconcile(target, Some(&asset.path)).await
            }
        }
    }

    /// Brings the local tree in line with one remote asset.
    ///
    /// `previous_path` is where the asset lived before a move, if known.
    pub(crate) async fn reconcile(
        &self,
        asset: &RemoteAssetRecord,
        previous_path: Option<&str>,
    ) -> SyncResult<()> {
        if self.is_pending(&asset.path).await {
            self.defer(asset);
            return Ok(());
        }
        if let Some(previous) = previous_path {
            if self.is_pending(previous).await {
                self.defer(asset);
                return Ok(());
            }
        }

        let mut link = self.ctx.state.link_for_asset(&asset.id).await?;
        let from = link
            .as_ref()
            .map(|l| l.path.clone())
            .or_else(|| previous_path.map(str::to_string));
        if let Some(from) = from.filter(|from| *from != asset.path) {
            if self.is_pending(&from).await {
                self.defer(asset);
                return Ok(());
            }
            link = self.relocate(&from, asset, link).await?;
        }

        if let Some(link) = &link {
            if link.path == asset.path && !link.remote_changed_since_sync(asset.updated_at) {
                debug!(path = %asset.path, "already in sync");
                return Ok(());
            }
        }

        let Some(file) = self.stat_local(&asset.path).await? else {
            self.ctx.download_to(&asset.path, asset).await?;
            return Ok(());
        };

        let local_changed = link
            .as_ref()
            .filter(|l| l.inode == file.inode)
            .map_or(true, |l| l.local_changed_since_sync(file.modified_at));
        if !local_changed {
            self.ctx.download_to(&asset.path, asset).await?;
            return Ok(());
        }

        let local_data = ignore_not_found(self.ctx.local.read_file(&file.path).await)
            .map_err(|e| SyncError::destination("read", &file.path, e))?;
        let Some(local_data) = local_data else {
            self.ctx.download_to(&asset.path, asset).await?;
            return Ok(());
        };
        if self.ctx.settle(&file, &local_data, asset).await? == Settlement::LocalWins {
            debug!(path = %file.path, "local version is newer; keeping it");
        }
        Ok(())
    }

    /// Moves the local file at `from` to follow a remote rename.
    async fn relocate(
        &self,
        from: &str,
        asset: &RemoteAssetRecord,
        link: Option<Link>,
    ) -> SyncResult<Option<Link>> {
        let Some(file) = self.stat_local(from).await? else {
            return Ok(link);
        };
        if link.as_ref().is_some_and(|l| l.inode != file.inode) {
            // Whatever sits at the old path now is not the linked file.
            return Ok(link);
        }

        debug!(source = %from, target = %asset.path, "following remote rename");
        self.ctx.echo.expect_move(from, &asset.path);
        let moved = self
            .ctx
            .local
            .move_file(from, &asset.path)
            .await
            .map_err(|e| SyncError::destination("move", from, e))?;

        let Some(link) = link else {
            return Ok(None);
        };
        let mut relocated = link.relocated(&moved.path);
        relocated.inode = moved.inode;
        self.ctx.state.link(&relocated).await?;
        Ok(Some(relocated))
    }

    async fn on_deleted(&self, id: &AssetId) -> SyncResult<()> {
        let Some(link) = self.ctx.state.link_for_asset(id).await? else {
            debug!(asset_id = %id, "no local counterpart for deleted asset");
            return Ok(());
        };
        if self.is_pending(&link.path).await {
            // Replaying the pending local change recreates the asset.
            debug!(path = %link.path, "local changes pending; keeping file");
            return Ok(());
        }

        if let Some(file) = self.stat_local(&link.path).await? {
            if file.inode != link.inode {
                debug!(path = %link.path, "path now holds a different file; keeping it");
            } else if link.local_changed_since_sync(file.modified_at) {
                warn!(path = %link.path, "remote asset deleted but local file has unsynced edits; keeping it");
            } else {
                self.ctx.echo.expect_delete(&link.path);
                ignore_not_found(self.ctx.local.delete_file(&link.path).await)
                    .map_err(|e| SyncError::destination("delete", &link.path, e))?;
                debug!(path = %link.path, "deleted local file");
            }
        }
        self.ctx.state.unlink(&link.inode).await
    }

    /// Re-reconciles remote changes deferred behind pending local actions.
    pub(crate) async fn retry_deferred(&self) -> SyncResult<usize> {
        let ids = self.ctx.take_deferred();
        let count = ids.len();
        for id in ids {
            let result = match ignore_not_found(self.ctx.remote.get_asset(&id).await) {
                Ok(Some(asset)) => self.reconcile(&asset, None).await,
                Ok(None) => self.on_deleted(&id).await,
                Err(e) => {
                    self.ctx.defer(id.clone());
                    Err(e)
                }
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(asset_id = %id, error = %e, "deferred remote change failed"),
            }
        }
        Ok(count)
    }

    async fn is_pending(&self, path: &str) -> bool {
        self.ctx.queue.touches(path).await
    }

    fn defer(&self, asset: &RemoteAssetRecord) {
        debug!(path = %asset.path, asset_id = %asset.id, "local actions pending; deferring remote change");
        self.ctx.defer(asset.id.clone());
    }

    async fn stat_local(&self, path: &str) -> SyncResult<Option<LocalFileRecord>> {
        self.ctx
            .local
            .get_file(path)
            .await
            .map_err(|e| SyncError::destination("stat", path, e))
    }
}
