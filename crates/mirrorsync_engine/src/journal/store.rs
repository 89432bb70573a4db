//! [`StateStore`] backed by the journal.

use super::{CompactStats, Journal, JournalRecord};
use crate::error::{SyncError, SyncResult};
use crate::store::StateStore;
use async_trait::async_trait;
use mirrorsync_protocol::{ActionId, AssetId, Inode, Link, PendingAction, Timestamp};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// A [`StateStore`] that persists to a [`Journal`].
///
/// Writes run on the blocking pool and return once the frame is synced.
/// Reads are served from the replayed in-memory state.
///
/// Every link refresh appends a frame, so the store compacts the journal
/// on its own once dead records outnumber live ones by
/// [`DEFAULT_COMPACT_RATIO`].
#[derive(Clone)]
pub struct JournalStateStore {
    journal: Arc<Mutex<Journal>>,
    policy: CompactPolicy,
}

/// Journals shorter than this are never compacted automatically.
pub const DEFAULT_COMPACT_MIN_RECORDS: u64 = 1024;

/// Records per live record that trigger automatic compaction.
pub const DEFAULT_COMPACT_RATIO: u64 = 4;

#[derive(Debug, Clone, Copy)]
struct CompactPolicy {
    min_records: u64,
    ratio: u64,
}

impl JournalStateStore {
    /// Opens the journal in `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> SyncResult<Self> {
        let dir = dir.into();
        let journal = blocking(move || Journal::open(&dir)).await?;
        Ok(Self {
            journal: Arc::new(Mutex::new(journal)),
            policy: CompactPolicy {
                min_records: DEFAULT_COMPACT_MIN_RECORDS,
                ratio: DEFAULT_COMPACT_RATIO,
            },
        })
    }

    /// Sets when the journal compacts itself.
    #[must_use]
    pub fn with_auto_compaction(mut self, min_records: u64, ratio: u64) -> Self {
        self.policy = CompactPolicy { min_records, ratio };
        self
    }

    /// Compacts the journal.
    pub async fn compact(&self) -> SyncResult<CompactStats> {
        let journal = self.journal.clone();
        blocking(move || journal.lock().compact()).await
    }

    /// Returns the number of records in the journal file.
    pub fn record_count(&self) -> u64 {
        self.journal.lock().record_count()
    }

    async fn write(&self, record: JournalRecord) -> SyncResult<()> {
        let journal = self.journal.clone();
        let policy = self.policy;
        blocking(move || {
            let mut journal = journal.lock();
            journal.append(record)?;
            if journal.needs_compaction(policy.min_records, policy.ratio) {
                // The record is already durable; a failed compaction only
                // leaves the journal longer than it needs to be.
                if let Err(e) = journal.compact() {
                    warn!(error = %e, "automatic journal compaction failed");
                }
            }
            Ok(())
        })
        .await
    }
}

async fn blocking<T, F>(f: F) -> SyncResult<T>
where
    F: FnOnce() -> SyncResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::queue(format!("journal task failed: {e}")))?
}

#[async_trait]
impl StateStore for JournalStateStore {
    async fn append_action(&self, action: &PendingAction) -> SyncResult<()> {
        self.write(JournalRecord::Append(action.clone())).await
    }

    async fn replace_action(&self, action: &PendingAction) -> SyncResult<()> {
        let known = self
            .journal
            .lock()
            .state()
            .actions
            .iter()
            .any(|a| a.id == action.id);
        if !known {
            return Err(SyncError::queue(format!("no queued action {}", action.id)));
        }
        self.write(JournalRecord::Replace(action.clone())).await
    }

    async fn remove_action(&self, id: ActionId) -> SyncResult<()> {
        let known = self.journal.lock().state().actions.iter().any(|a| a.id == id);
        if !known {
            return Ok(());
        }
        self.write(JournalRecord::Remove(id)).await
    }

    async fn list_actions(&self) -> SyncResult<Vec<PendingAction>> {
        Ok(self.journal.lock().state().actions.clone())
    }

    async fn link(&self, link: &Link) -> SyncResult<()> {
        let unchanged = self.journal.lock().state().links.by_inode(&link.inode) == Some(link);
        if unchanged {
            return Ok(());
        }
        self.write(JournalRecord::Link(link.clone())).await
    }

    async fn unlink(&self, inode: &Inode) -> SyncResult<()> {
        let known = self.journal.lock().state().links.by_inode(inode).is_some();
        if !known {
            return Ok(());
        }
        self.write(JournalRecord::Unlink(inode.clone())).await
    }

    async fn link_for_inode(&self, inode: &Inode) -> SyncResult<Option<Link>> {
        Ok(self.journal.lock().state().links.by_inode(inode).cloned())
    }

    async fn link_for_asset(&self, id: &AssetId) -> SyncResult<Option<Link>> {
        Ok(self.journal.lock().state().links.by_asset(id).cloned())
    }

    async fn link_for_path(&self, path: &str) -> SyncResult<Option<Link>> {
        Ok(self.journal.lock().state().links.by_path(path).cloned())
    }

    async fn last_synced_at(&self) -> SyncResult<Option<Timestamp>> {
        Ok(self.journal.lock().state().last_synced_at)
    }

    async fn set_last_synced_at(&self, at: Timestamp) -> SyncResult<()> {
        self.write(JournalRecord::LastSynced(at)).await
    }
}
