//! Local-to-remote direction handler.

use crate::context::{Settlement, SyncContext};
use crate::error::{ignore_not_found, SyncError, SyncResult};
use mirrorsync_protocol::{
    ActionKind, ChangeEvent, ChangeKind, Inode, Link, LocalFileRecord, ObjectRef, PendingAction,
    ProtocolError, RemoteAssetRecord,
};
use std::sync::Arc;
use tracing::debug;

/// Turns local changes into remote mutations, or into queued actions when
/// the remote store is unreachable.
///
/// A live event is also queued when pending actions already touch one of
/// its paths, so changes to a path always reach the remote store in the
/// order they happened.
pub(crate) struct LocalToRemote {
    ctx: Arc<SyncContext>,
}

impl LocalToRemote {
    pub(crate) fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Handles one local change event.
    pub(crate) async fn handle(&self, event: ChangeEvent) -> SyncResult<()> {
        event.validate()?;
        let Some(file) = event.source.as_local() else {
            return Err(ProtocolError::MalformedEvent(format!(
                "remote event for {} routed to the local handler",
                event.path()
            ))
            .into());
        };
        self.ctx.record(|s| s.events_handled += 1);
        debug!(kind = ?event.kind, path = %file.path, "local change");

        match event.kind {
            ChangeKind::Created | ChangeKind::Updated => {
                let kind = if event.kind == ChangeKind::Created {
                    ActionKind::Create
                } else {
                    ActionKind::Update
                };
                self.on_written(file, kind).await
            }
            ChangeKind::Deleted => self.on_deleted(file).await,
            ChangeKind::Moved => {
                let target = event
                    .target
                    .as_ref()
                    .and_then(ObjectRef::as_local)
                    .ok_or_else(|| {
                        ProtocolError::MalformedEvent(format!("moved event for {} has no target", file.path))
                    })?;
                self.on_moved(&file.path, target).await
            }
        }
    }

    async fn on_written(&self, file: &LocalFileRecord, kind: ActionKind) -> SyncResult<()> {
        let Some(data) = self.read_local(&file.path).await? else {
            debug!(path = %file.path, "file vanished before it could be read");
            return Ok(());
        };
        if self.ctx.echo.is_write_echo(&file.path, &data) {
            self.suppressed(&file.path);
            return Ok(());
        }

        let action = if kind == ActionKind::Create {
            PendingAction::create(&file.path)
        } else {
            PendingAction::update(&file.path)
        };
        if self.must_queue(&[file.path.as_str()]).await {
            return self.enqueue(action).await;
        }
        match self.push_file(file, data).await {
            Err(e) if e.is_unreachable() => self.enqueue(action).await,
            other => other,
        }
    }

    async fn on_deleted(&self, file: &LocalFileRecord) -> SyncResult<()> {
        if self.ctx.echo.is_delete_echo(&file.path) {
            self.suppressed(&file.path);
            return Ok(());
        }
        if self.must_queue(&[file.path.as_str()]).await {
            return self.enqueue(PendingAction::delete(&file.path)).await;
        }
        match self.delete_remote(&file.path, Some(&file.inode)).await {
            Err(e) if e.is_unreachable() => self.enqueue(PendingAction::delete(&file.path)).await,
            other => other,
        }
    }

    async fn on_moved(&self, source: &str, target: &LocalFileRecord) -> SyncResult<()> {
        if self.ctx.echo.is_move_echo(source, &target.path) {
            self.suppressed(&target.path);
            return Ok(());
        }
        let action = PendingAction::move_to(source, &target.path);
        if self.must_queue(&[source, target.path.as_str()]).await {
            return self.enqueue(action).await;
        }
        match self.move_remote(source, &target.path, Some(target)).await {
            Err(e) if e.is_unreachable() => self.enqueue(action).await,
            other => other,
        }
    }

    /// Replays a queued action against the remote store.
    ///
    /// Bytes are read from the local file at replay time. A file that no
    /// longer exists makes create and update a no-op; deleting an asset
    /// that is already gone succeeds.
    pub(crate) async fn apply_action(&self, action: &PendingAction) -> SyncResult<()> {
        action.validate()?;
        debug!(action_id = %action.id, action = %action, "replaying action");
        match action.kind {
            ActionKind::Create | ActionKind::Update => self.push_path(&action.path).await,
            ActionKind::Delete => self.delete_remote(&action.path, None).await,
            ActionKind::Move => {
                let target = action.target_path.as_deref().ok_or_else(|| {
                    ProtocolError::malformed_action(action.id, "move action is missing its target path")
                })?;
                let file = self.stat_local(target).await?;
                self.move_remote(&action.path, target, file.as_ref()).await
            }
        }
    }

    /// Pushes a file found changed during catch-up.
    ///
    /// Returns true if the file was pushed or queued.
    pub(crate) async fn reconcile_file(&self, file: &LocalFileRecord) -> SyncResult<bool> {
        if let Some(link) = self.ctx.state.link_for_inode(&file.inode).await? {
            if link.path != file.path && self.stat_local(&link.path).await?.is_none() {
                // Renamed while nobody was watching.
                self.on_moved(&link.path, file).await?;
                return Ok(true);
            }
            if link.path == file.path && !link.local_changed_since_sync(file.modified_at) {
                return Ok(false);
            }
        }
        self.on_written(file, ActionKind::Update).await?;
        Ok(true)
    }

    async fn must_queue(&self, paths: &[&str]) -> bool {
        if !self.ctx.remote.is_connected() {
            return true;
        }
        for path in paths {
            if self.ctx.queue.touches(path).await {
                return true;
            }
        }
        false
    }

    async fn enqueue(&self, action: PendingAction) -> SyncResult<()> {
        debug!(action = %action, "queueing local change");
        let plan = self.ctx.queue.enqueue(action).await?;
        self.ctx.record(|s| s.actions_enqueued += 1);
        if plan.is_noop() {
            debug!("collapsed into a pending action");
        }
        if self.ctx.remote.is_connected() {
            self.ctx.request_drain();
        }
        Ok(())
    }

    fn suppressed(&self, path: &str) {
        debug!(path = %path, "ignoring echo of the engine's own write");
        self.ctx.record(|s| s.echoes_suppressed += 1);
    }

    async fn stat_local(&self, path: &str) -> SyncResult<Option<LocalFileRecord>> {
        self.ctx
            .local
            .get_file(path)
            .await
            .map_err(|e| SyncError::destination("stat", path, e))
    }

    async fn read_local(&self, path: &str) -> SyncResult<Option<Vec<u8>>> {
        ignore_not_found(self.ctx.local.read_file(path).await)
            .map_err(|e| SyncError::destination("read", path, e))
    }

    async fn push_path(&self, path: &str) -> SyncResult<()> {
        let Some(file) = self.stat_local(path).await? else {
            debug!(path = %path, "local file is gone; nothing to push");
            return Ok(());
        };
        let Some(data) = self.read_local(path).await? else {
            return Ok(());
        };
        self.push_file(&file, data).await
    }

    /// Uploads a local file, creating the asset if the remote store has none.
    async fn push_file(&self, file: &LocalFileRecord, data: Vec<u8>) -> SyncResult<()> {
        let Some(asset) = self.resolve_asset(Some(&file.inode), &file.path).await? else {
            return self.create(file, data).await;
        };

        let link = self.ctx.state.link_for_asset(&asset.id).await?;
        let remote_changed = link
            .as_ref()
            .map_or(true, |l| l.remote_changed_since_sync(asset.updated_at));
        if remote_changed {
            match self.ctx.settle(file, &data, &asset).await? {
                Settlement::LocalWins => {}
                Settlement::RemoteWon | Settlement::Identical => return Ok(()),
                Settlement::RemoteGone => return self.create(file, data).await,
            }
        }

        match self.ctx.remote.update_asset_data(&asset.id, data).await {
            Ok(updated) => {
                debug!(path = %file.path, asset_id = %updated.id, "updated remote asset");
                self.ctx.link_pair(file, &updated).await
            }
            Err(e) if e.is_not_found() => {
                let Some(data) = self.read_local(&file.path).await? else {
                    return Ok(());
                };
                self.create(file, data).await
            }
            Err(e) => Err(SyncError::destination("update", &file.path, e)),
        }
    }

    async fn create(&self, file: &LocalFileRecord, data: Vec<u8>) -> SyncResult<()> {
        let asset = self
            .ctx
            .remote
            .create_asset(&file.path, data)
            .await
            .map_err(|e| SyncError::destination("create", &file.path, e))?;
        debug!(path = %file.path, asset_id = %asset.id, "created remote asset");
        self.ctx.link_pair(file, &asset).await
    }

    async fn delete_remote(&self, path: &str, inode: Option<&Inode>) -> SyncResult<()> {
        let Some(asset) = self.resolve_asset(inode, path).await? else {
            debug!(path = %path, "no remote asset to delete");
            return Ok(());
        };
        ignore_not_found(self.ctx.remote.delete_asset(&asset.id).await)
            .map_err(|e| SyncError::destination("delete", path, e))?;
        debug!(path = %path, asset_id = %asset.id, "deleted remote asset");
        if let Some(link) = self.ctx.state.link_for_asset(&asset.id).await? {
            self.ctx.state.unlink(&link.inode).await?;
        }
        Ok(())
    }

    async fn move_remote(
        &self,
        source: &str,
        target: &str,
        file: Option<&LocalFileRecord>,
    ) -> SyncResult<()> {
        let asset = self
            .resolve_asset(file.map(|f| &f.inode), source)
            .await?;

        if let Some(occupant) = self.find_remote(target).await? {
            if asset.as_ref().is_some_and(|a| a.id == occupant.id) {
                debug!(path = %target, "remote asset already moved");
                return self.relink_moved(&occupant, file).await;
            }
            // The local rename replaced whatever was at the target.
            ignore_not_found(self.ctx.remote.delete_asset(&occupant.id).await)
                .map_err(|e| SyncError::destination("delete", target, e))?;
            if let Some(link) = self.ctx.state.link_for_asset(&occupant.id).await? {
                self.ctx.state.unlink(&link.inode).await?;
            }
        }

        let Some(asset) = asset else {
            debug!(source = %source, target = %target, "no remote asset to move; creating at target");
            return self.push_path(target).await;
        };
        let moved = ignore_not_found(self.ctx.remote.move_asset(&asset.id, target).await)
            .map_err(|e| SyncError::destination("move", source, e))?;
        match moved {
            Some(moved) => {
                debug!(source = %source, target = %target, asset_id = %moved.id, "moved remote asset");
                self.relink_moved(&moved, file).await
            }
            None => self.push_path(target).await,
        }
    }

    async fn relink_moved(
        &self,
        moved: &RemoteAssetRecord,
        file: Option<&LocalFileRecord>,
    ) -> SyncResult<()> {
        let previous = self.ctx.state.link_for_asset(&moved.id).await?;
        match (previous, file) {
            (Some(link), Some(file)) if link.inode == file.inode => {
                self.ctx.state.link(&link.relocated(&moved.path)).await
            }
            (Some(link), None) => self.ctx.state.link(&link.relocated(&moved.path)).await,
            // Nothing ties the moved asset to the local file yet; compare contents.
            _ => self.push_path(&moved.path).await,
        }
    }

    /// Finds the remote asset backing a local file: by inode link, then by
    /// path link, then by path on the remote store.
    async fn resolve_asset(
        &self,
        inode: Option<&Inode>,
        path: &str,
    ) -> SyncResult<Option<RemoteAssetRecord>> {
        if let Some(inode) = inode {
            if let Some(link) = self.ctx.state.link_for_inode(inode).await? {
                if let Some(asset) = self.fetch_linked(&link).await? {
                    return Ok(Some(asset));
                }
            }
        }
        if let Some(link) = self.ctx.state.link_for_path(path).await? {
            if let Some(asset) = self.fetch_linked(&link).await? {
                return Ok(Some(asset));
            }
        }
        self.find_remote(path).await
    }

    async fn fetch_linked(&self, link: &Link) -> SyncResult<Option<RemoteAssetRecord>> {
        let asset = ignore_not_found(self.ctx.remote.get_asset(&link.asset_id).await)
            .map_err(|e| SyncError::destination("lookup", &link.path, e))?;
        if asset.is_none() {
            debug!(asset_id = %link.asset_id, "linked asset is gone");
            self.ctx.state.unlink(&link.inode).await?;
        }
        Ok(asset)
    }

    async fn find_remote(&self, path: &str) -> SyncResult<Option<RemoteAssetRecord>> {
        self.ctx
            .remote
            .find_asset_by_path(path)
            .await
            .map_err(|e| SyncError::destination("lookup", path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::memory::{MemoryFileSystem, MemoryRemoteStore, MemoryStateStore};
    use crate::store::StateStore;
    use mirrorsync_protocol::{AssetId, Timestamp};

    struct Fixture {
        local: Arc<MemoryFileSystem>,
        remote: Arc<MemoryRemoteStore>,
        state: Arc<MemoryStateStore>,
        outbound: LocalToRemote,
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
            outbound: LocalToRemote::new(Arc::new(ctx)),
        }
    }

    fn link(inode: &Inode, asset: &AssetId, path: &str) -> Link {
        Link::new(
            inode.clone(),
            asset.clone(),
            path,
            Timestamp::from_millis(1),
            Timestamp::from_millis(1),
        )
    }

    #[tokio::test]
    async fn resolve_prefers_inode_link() {
        let f = fixture().await;
        let by_path = f.remote.put_external("a", b"path");
        let by_inode = f.remote.put_external("b", b"inode");
        let inode = Inode::new("1");
        f.state.link(&link(&inode, &by_inode.id, "b")).await.unwrap();

        let found = f.outbound.resolve_asset(Some(&inode), "a").await.unwrap();
        assert_eq!(found.unwrap().id, by_inode.id);
        assert_ne!(by_path.id, by_inode.id);
    }

    #[tokio::test]
    async fn resolve_falls_back_to_path_link_when_inode_link_is_stale() {
        let f = fixture().await;
        let asset = f.remote.put_external("a", b"x");
        let stale = Inode::new("1");
        let current = Inode::new("2");
        f.state
            .link(&link(&stale, &AssetId::new("gone"), "old"))
            .await
            .unwrap();
        f.state.link(&link(&current, &asset.id, "a")).await.unwrap();

        let found = f.outbound.resolve_asset(Some(&stale), "a").await.unwrap();
        assert_eq!(found.unwrap().id, asset.id);
        assert!(f.state.link_for_inode(&stale).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolve_falls_back_to_remote_path() {
        let f = fixture().await;
        let asset = f.remote.put_external("c", b"x");

        let found = f.outbound.resolve_asset(None, "c").await.unwrap();
        assert_eq!(found.unwrap().id, asset.id);
        assert!(f.outbound.resolve_asset(None, "d").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn move_replaces_occupied_target() {
        let f = fixture().await;
        let created = f.local.put("a", b"mine");
        f.outbound
            .handle(ChangeEvent::created(ObjectRef::Local(created.clone())))
            .await
            .unwrap();
        let mine = f.remote.asset_at("a").unwrap();
        let occupant = f.remote.put_external("b", b"theirs");

        let after = f.local.rename("a", "b").unwrap();
        f.outbound
            .handle(ChangeEvent::moved(
                ObjectRef::Local(created),
                ObjectRef::Local(after.clone()),
            ))
            .await
            .unwrap();

        assert_eq!(f.remote.asset_count(), 1);
        assert_eq!(f.remote.asset_at("b").unwrap().id, mine.id);
        assert_ne!(mine.id, occupant.id);
        let link = f.state.link_for_path("b").await.unwrap().unwrap();
        assert_eq!(link.asset_id, mine.id);
        assert_eq!(link.inode, after.inode);
    }

    #[tokio::test]
    async fn move_onto_a_different_file_pushes_its_content() {
        let f = fixture().await;
        let original = f.local.put("a", b"old");
        f.outbound
            .handle(ChangeEvent::created(ObjectRef::Local(original.clone())))
            .await
            .unwrap();
        let asset = f.remote.asset_at("a").unwrap();

        // The file now at the target is not the one the asset was linked to.
        f.local.remove("a");
        let replacement = f.local.put("b", b"new");
        assert_ne!(replacement.inode, original.inode);
        f.outbound
            .move_remote("a", "b", Some(&replacement))
            .await
            .unwrap();

        assert_eq!(f.remote.contents().get("b").unwrap(), b"new");
        assert_eq!(f.remote.asset_count(), 1);
        let link = f.state.link_for_asset(&asset.id).await.unwrap().unwrap();
        assert_eq!(link.inode, replacement.inode);
        assert!(f
            .state
            .link_for_inode(&original.inode)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delete_of_missing_asset_succeeds() {
        let f = fixture().await;
        f.outbound
            .apply_action(&PendingAction::delete("nothing-here"))
            .await
            .unwrap();
        assert_eq!(f.remote.asset_count(), 0);
    }

    #[tokio::test]
    async fn unreachable_remote_queues_the_change() {
        let f = fixture().await;
        f.remote.set_connected(false);
        let file = f.local.put("a", b"x");
        f.outbound
            .handle(ChangeEvent::created(ObjectRef::Local(file)))
            .await
            .unwrap();

        let pending = f.outbound.ctx.queue.snapshot().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, ActionKind::Create);
    }
}
