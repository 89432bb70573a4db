//! Collaborator contracts consumed by the engine.
//!
//! The engine never touches a disk, a network or a database directly. It
//! talks to the local tree, the remote asset store and its own durable
//! state through these three traits.

use crate::error::SyncResult;
use async_trait::async_trait;
use mirrorsync_protocol::{
    ActionId, AssetId, ChangeEvent, Inode, Link, LocalFileRecord, PendingAction,
    RemoteAssetRecord, Timestamp,
};
use tokio::sync::{mpsc, watch};

/// One page of a remote asset listing.
#[derive(Debug, Clone, Default)]
pub struct AssetPage {
    /// Assets on this page.
    pub assets: Vec<RemoteAssetRecord>,
    /// Cursor for the next page, if any.
    pub next_cursor: Option<String>,
}

/// The remote asset store.
///
/// Missing objects are reported as [`SyncError::NotFound`] and calls made
/// while disconnected fail with [`SyncError::Unreachable`].
///
/// [`SyncError::NotFound`]: crate::SyncError::NotFound
/// [`SyncError::Unreachable`]: crate::SyncError::Unreachable
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Returns true if the store is currently reachable.
    fn is_connected(&self) -> bool;

    /// Watches connectivity; the value flips on connect and disconnect.
    fn connectivity(&self) -> watch::Receiver<bool>;

    /// Subscribes to change notifications.
    ///
    /// Delivery is at-least-once and unordered across assets.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeEvent>;

    /// Fetches an asset by ID.
    async fn get_asset(&self, id: &AssetId) -> SyncResult<RemoteAssetRecord>;

    /// Looks up the asset currently at `path`.
    async fn find_asset_by_path(&self, path: &str) -> SyncResult<Option<RemoteAssetRecord>>;

    /// Lists assets changed at or after `changed_since`.
    async fn list_assets(
        &self,
        changed_since: Timestamp,
        cursor: Option<String>,
        limit: u32,
    ) -> SyncResult<AssetPage>;

    /// Creates an asset at `path`.
    async fn create_asset(&self, path: &str, data: Vec<u8>) -> SyncResult<RemoteAssetRecord>;

    /// Overwrites an asset's data.
    async fn update_asset_data(&self, id: &AssetId, data: Vec<u8>)
        -> SyncResult<RemoteAssetRecord>;

    /// Retargets an asset to `target`.
    async fn move_asset(&self, id: &AssetId, target: &str) -> SyncResult<RemoteAssetRecord>;

    /// Downloads an asset's data.
    async fn download_asset(&self, id: &AssetId) -> SyncResult<Vec<u8>>;

    /// Deletes an asset.
    async fn delete_asset(&self, id: &AssetId) -> SyncResult<()>;
}

/// The local directory tree.
#[async_trait]
pub trait LocalFileSystem: Send + Sync + 'static {
    /// Subscribes to change notifications, delivered in discovery order.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeEvent>;

    /// Returns the record for `path`, if a file exists there.
    async fn get_file(&self, path: &str) -> SyncResult<Option<LocalFileRecord>>;

    /// Reads a file's bytes.
    async fn read_file(&self, path: &str) -> SyncResult<Vec<u8>>;

    /// Creates or overwrites a file.
    async fn write_file(&self, path: &str, data: Vec<u8>) -> SyncResult<LocalFileRecord>;

    /// Deletes a file.
    async fn delete_file(&self, path: &str) -> SyncResult<()>;

    /// Renames a file, replacing anything at `target`.
    async fn move_file(&self, source: &str, target: &str) -> SyncResult<LocalFileRecord>;

    /// Lists files modified or changed at or after `changed_since`.
    async fn list_files(&self, changed_since: Timestamp) -> SyncResult<Vec<LocalFileRecord>>;
}

/// Durable engine state: the pending action queue, identity links and
/// sync bookkeeping.
///
/// Every failure is a [`SyncError::Queue`](crate::SyncError::Queue), which
/// the engine treats as fatal.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Appends an action at the end of the queue.
    async fn append_action(&self, action: &PendingAction) -> SyncResult<()>;

    /// Rewrites a queued action in place.
    async fn replace_action(&self, action: &PendingAction) -> SyncResult<()>;

    /// Removes a queued action. Removing an unknown ID is not an error.
    async fn remove_action(&self, id: ActionId) -> SyncResult<()>;

    /// Lists queued actions in replay order.
    async fn list_actions(&self) -> SyncResult<Vec<PendingAction>>;

    /// Records a link, replacing any link sharing its inode, asset or path.
    async fn link(&self, link: &Link) -> SyncResult<()>;

    /// Removes the link for a local inode.
    async fn unlink(&self, inode: &Inode) -> SyncResult<()>;

    /// Returns the link for a local inode.
    async fn link_for_inode(&self, inode: &Inode) -> SyncResult<Option<Link>>;

    /// Returns the link for a remote asset.
    async fn link_for_asset(&self, id: &AssetId) -> SyncResult<Option<Link>>;

    /// Returns the link last recorded at `path`.
    async fn link_for_path(&self, path: &str) -> SyncResult<Option<Link>>;

    /// Returns when the last complete catch-up started.
    async fn last_synced_at(&self) -> SyncResult<Option<Timestamp>>;

    /// Records when the last complete catch-up started.
    async fn set_last_synced_at(&self, at: Timestamp) -> SyncResult<()>;
}
