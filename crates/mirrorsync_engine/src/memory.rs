//! In-memory collaborators for tests and embedding.
//!
//! [`MemoryRemoteStore`] and [`MemoryFileSystem`] raise change events the
//! way real adapters do, and expose helpers for mutating them from the
//! outside, toggling connectivity and injecting failures.
//! [`MemoryStateStore`] keeps engine state in memory.

use crate::error::{SyncError, SyncResult};
use crate::identity::LinkTable;
use crate::store::{AssetPage, LocalFileSystem, RemoteStore, StateStore};
use async_trait::async_trait;
use mirrorsync_protocol::{
    ActionId, AssetId, ChangeEvent, Inode, Link, LocalFileRecord, ObjectRef, PendingAction,
    RemoteAssetRecord, Timestamp,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};

static CLOCK: AtomicU64 = AtomicU64::new(0);

/// Returns a strictly increasing wall-clock timestamp.
///
/// Both memory stores share it, so their timestamps are totally ordered.
fn tick() -> Timestamp {
    let now = Timestamp::now().as_millis();
    let mut last = CLOCK.load(Ordering::SeqCst);
    loop {
        let next = now.max(last + 1);
        match CLOCK.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return Timestamp::from_millis(next),
            Err(current) => last = current,
        }
    }
}

#[derive(Default)]
struct Subscribers(Mutex<Vec<mpsc::UnboundedSender<ChangeEvent>>>);

impl Subscribers {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.0.lock().push(tx);
        rx
    }

    fn emit(&self, event: ChangeEvent) {
        self.0.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }
}

struct StoredAsset {
    record: RemoteAssetRecord,
    data: Vec<u8>,
}

#[derive(Default)]
struct RemoteInner {
    assets: BTreeMap<AssetId, StoredAsset>,
    next_id: u64,
    creates: u64,
    failing: HashSet<String>,
}

impl RemoteInner {
    fn id_at(&self, path: &str) -> Option<AssetId> {
        self.assets
            .values()
            .find(|a| a.record.path == path)
            .map(|a| a.record.id.clone())
    }

    fn check_path(&self, path: &str) -> SyncResult<()> {
        if self.failing.contains(path) {
            return Err(SyncError::transport_retryable(format!(
                "injected failure for {path}"
            )));
        }
        Ok(())
    }

    fn stored(&self, id: &AssetId) -> SyncResult<&StoredAsset> {
        let asset = self
            .assets
            .get(id)
            .ok_or_else(|| SyncError::not_found(format!("asset {id}")))?;
        self.check_path(&asset.record.path)?;
        Ok(asset)
    }

    fn insert(&mut self, path: &str, data: Vec<u8>) -> RemoteAssetRecord {
        self.next_id += 1;
        self.creates += 1;
        let id = AssetId::new(format!("asset-{}", self.next_id));
        let now = tick();
        let record = RemoteAssetRecord {
            url: format!("memory://assets/{id}"),
            id: id.clone(),
            path: path.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.assets.insert(
            id,
            StoredAsset {
                record: record.clone(),
                data,
            },
        );
        record
    }
}

/// A remote asset store held in memory.
///
/// Calls fail with [`SyncError::Unreachable`] while disconnected. Change
/// events are raised only for external mutations made through the helper
/// methods, and only while connected; mutations made through the
/// [`RemoteStore`] trait are the engine's own and raise nothing.
pub struct MemoryRemoteStore {
    inner: Mutex<RemoteInner>,
    connected: watch::Sender<bool>,
    subscribers: Subscribers,
}

impl MemoryRemoteStore {
    /// Creates an empty, connected store.
    pub fn new() -> Self {
        let (connected, _) = watch::channel(true);
        Self {
            inner: Mutex::new(RemoteInner::default()),
            connected,
            subscribers: Subscribers::default(),
        }
    }

    /// Connects or disconnects the store.
    pub fn set_connected(&self, connected: bool) {
        self.connected.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }

    /// Makes every call touching `path` fail with a retryable error.
    pub fn fail_path(&self, path: &str) {
        self.inner.lock().failing.insert(path.to_string());
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.inner.lock().failing.clear();
    }

    /// Creates or overwrites the asset at `path` as another client would.
    pub fn put_external(&self, path: &str, data: &[u8]) -> RemoteAssetRecord {
        let mut inner = self.inner.lock();
        let now = tick();
        let existing = inner.id_at(path);
        let updated = existing
            .and_then(|id| inner.assets.get_mut(&id).map(|stored| {
                stored.data = data.to_vec();
                stored.record.updated_at = now;
                stored.record.clone()
            }));
        let (record, created) = match updated {
            Some(record) => (record, false),
            None => (inner.insert(path, data.to_vec()), true),
        };
        drop(inner);

        let source = ObjectRef::Remote(record.clone());
        self.emit(if created {
            ChangeEvent::created(source)
        } else {
            ChangeEvent::updated(source)
        });
        record
    }

    /// Deletes the asset at `path` as another client would.
    pub fn delete_external(&self, path: &str) -> Option<RemoteAssetRecord> {
        let removed = {
            let mut inner = self.inner.lock();
            let id = inner.id_at(path)?;
            inner.assets.remove(&id)?.record
        };
        self.emit(ChangeEvent::deleted(ObjectRef::Remote(removed.clone())));
        Some(removed)
    }

    /// Moves the asset at `source` to `target` as another client would.
    pub fn move_external(&self, source: &str, target: &str) -> Option<RemoteAssetRecord> {
        let (before, after) = {
            let mut inner = self.inner.lock();
            let id = inner.id_at(source)?;
            if let Some(occupant) = inner.id_at(target) {
                inner.assets.remove(&occupant);
            }
            let stored = inner.assets.get_mut(&id)?;
            let before = stored.record.clone();
            stored.record.path = target.to_string();
            stored.record.updated_at = tick();
            (before, stored.record.clone())
        };
        self.emit(ChangeEvent::moved(
            ObjectRef::Remote(before),
            ObjectRef::Remote(after.clone()),
        ));
        Some(after)
    }

    /// Returns the asset at `path`.
    pub fn asset_at(&self, path: &str) -> Option<RemoteAssetRecord> {
        let inner = self.inner.lock();
        let id = inner.id_at(path)?;
        inner.assets.get(&id).map(|a| a.record.clone())
    }

    /// Returns every asset's data keyed by path.
    pub fn contents(&self) -> BTreeMap<String, Vec<u8>> {
        self.inner
            .lock()
            .assets
            .values()
            .map(|a| (a.record.path.clone(), a.data.clone()))
            .collect()
    }

    /// Returns the number of assets.
    pub fn asset_count(&self) -> usize {
        self.inner.lock().assets.len()
    }

    /// Returns how many assets were ever created.
    pub fn create_count(&self) -> u64 {
        self.inner.lock().creates
    }

    fn emit(&self, event: ChangeEvent) {
        if *self.connected.borrow() {
            self.subscribers.emit(event);
        }
    }

    fn ensure_connected(&self) -> SyncResult<()> {
        if *self.connected.borrow() {
            Ok(())
        } else {
            Err(SyncError::Unreachable)
        }
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        self.subscribers.subscribe()
    }

    async fn get_asset(&self, id: &AssetId) -> SyncResult<RemoteAssetRecord> {
        self.ensure_connected()?;
        Ok(self.inner.lock().stored(id)?.record.clone())
    }

    async fn find_asset_by_path(&self, path: &str) -> SyncResult<Option<RemoteAssetRecord>> {
        self.ensure_connected()?;
        let inner = self.inner.lock();
        inner.check_path(path)?;
        Ok(inner
            .id_at(path)
            .and_then(|id| inner.assets.get(&id))
            .map(|a| a.record.clone()))
    }

    async fn list_assets(
        &self,
        changed_since: Timestamp,
        cursor: Option<String>,
        limit: u32,
    ) -> SyncResult<AssetPage> {
        self.ensure_connected()?;
        let offset = match cursor {
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| SyncError::transport_fatal(format!("invalid cursor {cursor}")))?,
            None => 0,
        };
        let limit = limit.max(1) as usize;

        let mut changed: Vec<RemoteAssetRecord> = self
            .inner
            .lock()
            .assets
            .values()
            .filter(|a| a.record.updated_at >= changed_since)
            .map(|a| a.record.clone())
            .collect();
        changed.sort_by(|a, b| (a.updated_at, &a.id).cmp(&(b.updated_at, &b.id)));

        let end = (offset + limit).min(changed.len());
        let assets = changed.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_cursor = (end < changed.len()).then(|| end.to_string());
        Ok(AssetPage {
            assets,
            next_cursor,
        })
    }

    async fn create_asset(&self, path: &str, data: Vec<u8>) -> SyncResult<RemoteAssetRecord> {
        self.ensure_connected()?;
        let mut inner = self.inner.lock();
        inner.check_path(path)?;
        if inner.id_at(path).is_some() {
            return Err(SyncError::transport_fatal(format!(
                "an asset already exists at {path}"
            )));
        }
        Ok(inner.insert(path, data))
    }

    async fn update_asset_data(
        &self,
        id: &AssetId,
        data: Vec<u8>,
    ) -> SyncResult<RemoteAssetRecord> {
        self.ensure_connected()?;
        let mut inner = self.inner.lock();
        inner.stored(id)?;
        let stored = inner
            .assets
            .get_mut(id)
            .ok_or_else(|| SyncError::not_found(format!("asset {id}")))?;
        stored.data = data;
        stored.record.updated_at = tick();
        Ok(stored.record.clone())
    }

    async fn move_asset(&self, id: &AssetId, target: &str) -> SyncResult<RemoteAssetRecord> {
        self.ensure_connected()?;
        let mut inner = self.inner.lock();
        inner.stored(id)?;
        inner.check_path(target)?;
        if inner.id_at(target).is_some_and(|occupant| occupant != *id) {
            return Err(SyncError::transport_fatal(format!(
                "an asset already exists at {target}"
            )));
        }
        let stored = inner
            .assets
            .get_mut(id)
            .ok_or_else(|| SyncError::not_found(format!("asset {id}")))?;
        // A move does not change content, so updated_at stays put.
        stored.record.path = target.to_string();
        Ok(stored.record.clone())
    }

    async fn download_asset(&self, id: &AssetId) -> SyncResult<Vec<u8>> {
        self.ensure_connected()?;
        Ok(self.inner.lock().stored(id)?.data.clone())
    }

    async fn delete_asset(&self, id: &AssetId) -> SyncResult<()> {
        self.ensure_connected()?;
        let mut inner = self.inner.lock();
        inner.stored(id)?;
        inner.assets.remove(id);
        Ok(())
    }
}

struct MemoryFile {
    record: LocalFileRecord,
    data: Vec<u8>,
}

#[derive(Default)]
struct FsInner {
    files: BTreeMap<String, MemoryFile>,
    next_inode: u64,
}

/// A local file tree held in memory.
///
/// Inodes survive overwrites and renames. Every mutation, whether made
/// through the helpers or the [`LocalFileSystem`] trait, raises a change
/// event, just as a real watcher reports the engine's own writes.
#[derive(Default)]
pub struct MemoryFileSystem {
    inner: Mutex<FsInner>,
    subscribers: Subscribers,
}

impl MemoryFileSystem {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or overwrites a file.
    pub fn put(&self, path: &str, data: &[u8]) -> LocalFileRecord {
        let now = tick();
        let (record, created) = {
            let mut inner = self.inner.lock();
            match inner.files.get_mut(path) {
                Some(file) => {
                    file.data = data.to_vec();
                    file.record.modified_at = now;
                    file.record.changed_at = now;
                    (file.record.clone(), false)
                }
                None => {
                    inner.next_inode += 1;
                    let inode = Inode::new(inner.next_inode.to_string());
                    let record = LocalFileRecord::new(path, inode, now, now);
                    inner.files.insert(
                        path.to_string(),
                        MemoryFile {
                            record: record.clone(),
                            data: data.to_vec(),
                        },
                    );
                    (record, true)
                }
            }
        };
        let source = ObjectRef::Local(record.clone());
        self.subscribers.emit(if created {
            ChangeEvent::created(source)
        } else {
            ChangeEvent::updated(source)
        });
        record
    }

    /// Deletes a file.
    pub fn remove(&self, path: &str) -> Option<LocalFileRecord> {
        let removed = self.inner.lock().files.remove(path)?.record;
        self.subscribers
            .emit(ChangeEvent::deleted(ObjectRef::Local(removed.clone())));
        Some(removed)
    }

    /// Renames a file, replacing anything at `target`.
    pub fn rename(&self, source: &str, target: &str) -> Option<LocalFileRecord> {
        let (before, after) = {
            let mut inner = self.inner.lock();
            let mut file = inner.files.remove(source)?;
            let before = file.record.clone();
            file.record.path = target.to_string();
            file.record.changed_at = tick();
            let after = file.record.clone();
            inner.files.insert(target.to_string(), file);
            (before, after)
        };
        self.subscribers.emit(ChangeEvent::moved(
            ObjectRef::Local(before),
            ObjectRef::Local(after.clone()),
        ));
        Some(after)
    }

    /// Returns the record at `path`.
    pub fn file(&self, path: &str) -> Option<LocalFileRecord> {
        self.inner.lock().files.get(path).map(|f| f.record.clone())
    }

    /// Returns every file's data keyed by path.
    pub fn contents(&self) -> BTreeMap<String, Vec<u8>> {
        self.inner
            .lock()
            .files
            .iter()
            .map(|(path, f)| (path.clone(), f.data.clone()))
            .collect()
    }
}

fn missing_file(path: &str) -> SyncError {
    SyncError::not_found(format!("file {path}"))
}

#[async_trait]
impl LocalFileSystem for MemoryFileSystem {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        self.subscribers.subscribe()
    }

    async fn get_file(&self, path: &str) -> SyncResult<Option<LocalFileRecord>> {
        Ok(self.file(path))
    }

    async fn read_file(&self, path: &str) -> SyncResult<Vec<u8>> {
        self.inner
            .lock()
            .files
            .get(path)
            .map(|f| f.data.clone())
            .ok_or_else(|| missing_file(path))
    }

    async fn write_file(&self, path: &str, data: Vec<u8>) -> SyncResult<LocalFileRecord> {
        Ok(self.put(path, &data))
    }

    async fn delete_file(&self, path: &str) -> SyncResult<()> {
        self.remove(path).map(|_| ()).ok_or_else(|| missing_file(path))
    }

    async fn move_file(&self, source: &str, target: &str) -> SyncResult<LocalFileRecord> {
        self.rename(source, target).ok_or_else(|| missing_file(source))
    }

    async fn list_files(&self, changed_since: Timestamp) -> SyncResult<Vec<LocalFileRecord>> {
        Ok(self
            .inner
            .lock()
            .files
            .values()
            .filter(|f| {
                f.record.modified_at >= changed_since || f.record.changed_at >= changed_since
            })
            .map(|f| f.record.clone())
            .collect())
    }
}

#[derive(Default)]
struct StateInner {
    actions: Vec<PendingAction>,
    links: LinkTable,
    last_synced_at: Option<Timestamp>,
}

/// Engine state held in memory.
///
/// [`set_unavailable`](Self::set_unavailable) makes every call fail with a
/// storage error, which the engine treats as fatal.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<StateInner>,
    unavailable: AtomicBool,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store with pre-queued actions.
    pub fn with_actions(actions: Vec<PendingAction>) -> Self {
        let store = Self::new();
        store.inner.lock().actions = actions;
        store
    }

    /// Makes the store fail every call, or recover.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns every recorded link.
    pub fn links(&self) -> Vec<Link> {
        self.inner.lock().links.iter().cloned().collect()
    }

    fn check(&self) -> SyncResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(SyncError::queue("state store unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn append_action(&self, action: &PendingAction) -> SyncResult<()> {
        self.check()?;
        self.inner.lock().actions.push(action.clone());
        Ok(())
    }

    async fn replace_action(&self, action: &PendingAction) -> SyncResult<()> {
        self.check()?;
        let mut inner = self.inner.lock();
        let slot = inner
            .actions
            .iter_mut()
            .find(|a| a.id == action.id)
            .ok_or_else(|| SyncError::queue(format!("no queued action {}", action.id)))?;
        *slot = action.clone();
        Ok(())
    }

    async fn remove_action(&self, id: ActionId) -> SyncResult<()> {
        self.check()?;
        self.inner.lock().actions.retain(|a| a.id != id);
        Ok(())
    }

    async fn list_actions(&self) -> SyncResult<Vec<PendingAction>> {
        self.check()?;
        Ok(self.inner.lock().actions.clone())
    }

    async fn link(&self, link: &Link) -> SyncResult<()> {
        self.check()?;
        self.inner.lock().links.insert(link.clone());
        Ok(())
    }

    async fn unlink(&self, inode: &Inode) -> SyncResult<()> {
        self.check()?;
        self.inner.lock().links.remove(inode);
        Ok(())
    }

    async fn link_for_inode(&self, inode: &Inode) -> SyncResult<Option<Link>> {
        self.check()?;
        Ok(self.inner.lock().links.by_inode(inode).cloned())
    }

    async fn link_for_asset(&self, id: &AssetId) -> SyncResult<Option<Link>> {
        self.check()?;
        Ok(self.inner.lock().links.by_asset(id).cloned())
    }

    async fn link_for_path(&self, path: &str) -> SyncResult<Option<Link>> {
        self.check()?;
        Ok(self.inner.lock().links.by_path(path).cloned())
    }

    async fn last_synced_at(&self) -> SyncResult<Option<Timestamp>> {
        self.check()?;
        Ok(self.inner.lock().last_synced_at)
    }

    async fn set_last_synced_at(&self, at: Timestamp) -> SyncResult<()> {
        self.check()?;
        self.inner.lock().last_synced_at = Some(at);
        Ok(())
    }
}
