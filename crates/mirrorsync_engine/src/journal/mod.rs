//! Durable engine state in an append-only journal.
//!
//! The state directory layout:
//!
//! ```text
//! <state_dir>/
//! ├─ LOCK            # Advisory lock, one engine per directory
//! └─ journal.log     # Framed, checksummed state mutations
//! ```
//!
//! Every queue or link mutation appends one frame and syncs it before the
//! call returns. Opening the journal replays it into memory. A frame cut
//! short by a crash is truncated away; anything else that fails validation
//! refuses to open, since silently dropping queued intents would lose user
//! changes.

mod record;
mod store;

pub use record::{compute_crc32, scan, JournalRecord, JournalScan, RecordType, ScanEnd, JOURNAL_MAGIC};
pub use store::{JournalStateStore, DEFAULT_COMPACT_MIN_RECORDS, DEFAULT_COMPACT_RATIO};

use crate::error::{SyncError, SyncResult};
use crate::identity::LinkTable;
use fs2::FileExt;
use mirrorsync_protocol::{PendingAction, Timestamp};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const LOCK_FILE: &str = "LOCK";
const JOURNAL_FILE: &str = "journal.log";
const JOURNAL_TEMP: &str = "journal.log.tmp";

/// Engine state rebuilt from journal records.
#[derive(Debug, Clone, Default)]
pub struct JournalState {
    /// Queued actions in replay order.
    pub actions: Vec<PendingAction>,
    /// Identity links.
    pub links: LinkTable,
    /// Catch-up watermark.
    pub last_synced_at: Option<Timestamp>,
}

impl JournalState {
    /// Rebuilds state from records in journal order.
    pub fn from_records(records: impl IntoIterator<Item = JournalRecord>) -> Self {
        let mut state = Self::default();
        for record in records {
            state.apply(record);
        }
        state
    }

    /// Applies one record.
    ///
    /// Replacing or removing an unknown action is a no-op.
    pub fn apply(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::Append(action) => self.actions.push(action),
            JournalRecord::Replace(action) => {
                if let Some(slot) = self.actions.iter_mut().find(|a| a.id == action.id) {
                    *slot = action;
                }
            }
            JournalRecord::Remove(id) => self.actions.retain(|a| a.id != id),
            JournalRecord::Link(link) => {
                self.links.insert(link);
            }
            JournalRecord::Unlink(inode) => {
                self.links.remove(&inode);
            }
            JournalRecord::LastSynced(at) => self.last_synced_at = Some(at),
        }
    }

    /// Returns the number of records [`live_records`](Self::live_records) yields.
    pub fn live_count(&self) -> usize {
        self.actions.len() + self.links.len() + usize::from(self.last_synced_at.is_some())
    }

    /// Returns the shortest record sequence that rebuilds this state.
    pub fn live_records(&self) -> Vec<JournalRecord> {
        let mut links: Vec<_> = self.links.iter().cloned().collect();
        links.sort_by(|a, b| a.path.cmp(&b.path));

        let mut records: Vec<JournalRecord> = self
            .actions
            .iter()
            .cloned()
            .map(JournalRecord::Append)
            .collect();
        records.extend(links.into_iter().map(JournalRecord::Link));
        if let Some(at) = self.last_synced_at {
            records.push(JournalRecord::LastSynced(at));
        }
        records
    }
}

/// Outcome of a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactStats {
    /// Records before compaction.
    pub records_before: u64,
    /// Records after compaction.
    pub records_after: u64,
    /// File size before compaction.
    pub bytes_before: u64,
    /// File size after compaction.
    pub bytes_after: u64,
}

/// An open, locked journal.
///
/// This is the blocking core of [`JournalStateStore`]; tools use it
/// directly.
#[derive(Debug)]
pub struct Journal {
    dir: PathBuf,
    file: File,
    state: JournalState,
    records: u64,
    size: u64,
    _lock_file: File,
}

impl Journal {
    /// Opens or creates the journal in `dir`.
    ///
    /// # Errors
    ///
    /// Fails with [`SyncError::Queue`] if another process holds the lock,
    /// the journal is corrupt, or I/O fails.
    pub fn open(dir: &Path) -> SyncResult<Self> {
        fs::create_dir_all(dir).map_err(storage)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))
            .map_err(storage)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(SyncError::queue(format!(
                "state directory {} is locked by another process",
                dir.display()
            )));
        }

        let path = dir.join(JOURNAL_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(storage(e)),
        };
        let scan = scan(&bytes);
        match &scan.end {
            ScanEnd::Clean => {}
            ScanEnd::TornTail { offset } => {
                warn!(offset, dropped = bytes.len() as u64 - offset, "truncating torn journal tail");
            }
            ScanEnd::Corrupt { offset, reason } => {
                return Err(SyncError::queue(format!(
                    "journal {} is corrupt at offset {offset}: {reason}",
                    path.display()
                )));
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(storage)?;
        if scan.valid_len < bytes.len() as u64 {
            file.set_len(scan.valid_len).map_err(storage)?;
            file.sync_all().map_err(storage)?;
        }

        let records = scan.records.len() as u64;
        let state = JournalState::from_records(scan.records.into_iter().map(|(_, r)| r));
        info!(
            path = %path.display(),
            records,
            pending = state.actions.len(),
            links = state.links.len(),
            "opened journal"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            state,
            records,
            size: scan.valid_len,
            _lock_file: lock_file,
        })
    }

    /// Appends a record and syncs it to disk, then applies it in memory.
    ///
    /// A failed write is rolled back to the last complete frame, so the
    /// next append does not land behind a partial one.
    pub fn append(&mut self, record: JournalRecord) -> SyncResult<()> {
        let frame = record.encode()?;
        let written = self
            .file
            .write_all(&frame)
            .and_then(|()| self.file.sync_data());
        if let Err(e) = written {
            self.discard_partial_write();
            return Err(storage(e));
        }
        self.size += frame.len() as u64;
        self.records += 1;
        self.state.apply(record);
        Ok(())
    }

    fn discard_partial_write(&mut self) {
        if let Err(e) = self.file.set_len(self.size) {
            warn!(error = %e, size = self.size, "failed to roll back partial journal write");
        }
    }

    /// Returns true once dead records outweigh live ones by `ratio`.
    pub fn needs_compaction(&self, min_records: u64, ratio: u64) -> bool {
        let live = self.state.live_count() as u64;
        self.records >= min_records && self.records > live.max(1).saturating_mul(ratio)
    }

    /// Rewrites the journal with only the records needed to rebuild the
    /// current state.
    ///
    /// The new journal is written to a temporary file, synced and renamed
    /// over the old one.
    pub fn compact(&mut self) -> SyncResult<CompactStats> {
        let live = self.state.live_records();
        let mut bytes = Vec::new();
        for record in &live {
            bytes.extend(record.encode()?);
        }

        let temp_path = self.dir.join(JOURNAL_TEMP);
        let path = self.path();
        let mut temp = File::create(&temp_path).map_err(storage)?;
        temp.write_all(&bytes).map_err(storage)?;
        temp.sync_all().map_err(storage)?;
        drop(temp);
        fs::rename(&temp_path, &path).map_err(storage)?;
        sync_directory(&self.dir)?;

        self.file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&path)
            .map_err(storage)?;
        let stats = CompactStats {
            records_before: self.records,
            records_after: live.len() as u64,
            bytes_before: self.size,
            bytes_after: bytes.len() as u64,
        };
        self.records = stats.records_after;
        self.size = stats.bytes_after;
        debug!(?stats, "compacted journal");
        Ok(stats)
    }

    /// Returns the replayed state.
    pub fn state(&self) -> &JournalState {
        &self.state
    }

    /// Returns the number of records in the file.
    pub fn record_count(&self) -> u64 {
        self.records
    }

    /// Returns the file size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the journal file path.
    pub fn path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }
}

/// Returns the journal path inside a state directory.
pub fn journal_path(dir: &Path) -> PathBuf {
    dir.join(JOURNAL_FILE)
}

/// Scans the journal in `dir` without locking or repairing it.
pub fn read_journal(dir: &Path) -> SyncResult<JournalScan> {
    let bytes = fs::read(journal_path(dir)).map_err(storage)?;
    Ok(scan(&bytes))
}

fn storage(err: std::io::Error) -> SyncError {
    SyncError::queue(err.to_string())
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> SyncResult<()> {
    File::open(dir).and_then(|d| d.sync_all()).map_err(storage)
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> SyncResult<()> {
    Ok(())
}
