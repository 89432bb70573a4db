//! CLI command implementations.

pub mod compact;
pub mod dump_journal;
pub mod inspect;
pub mod verify;

use mirrorsync_engine::{journal_path, read_journal, JournalRecord, JournalScan, RecordType, ScanEnd};
use std::path::Path;
use tracing::debug;

/// Reads and scans the journal in `dir`, returning its size and the scan.
pub(crate) fn load(dir: &Path) -> Result<(u64, JournalScan), Box<dyn std::error::Error>> {
    let path = journal_path(dir);
    if !path.exists() {
        return Err(format!("No journal found at {:?}", path).into());
    }
    let size = std::fs::metadata(&path)?.len();
    let scan = read_journal(dir)?;
    debug!(records = scan.records.len(), size, "scanned journal");
    Ok((size, scan))
}

/// Short uppercase name of a record type.
pub(crate) fn record_label(kind: RecordType) -> &'static str {
    match kind {
        RecordType::Append => "APPEND",
        RecordType::Replace => "REPLACE",
        RecordType::Remove => "REMOVE",
        RecordType::Link => "LINK",
        RecordType::Unlink => "UNLINK",
        RecordType::LastSynced => "WATERMARK",
    }
}

/// One-line description of a record's payload.
pub(crate) fn summarize(record: &JournalRecord) -> String {
    match record {
        JournalRecord::Append(action) | JournalRecord::Replace(action) => {
            format!("{} [{}]", action, action.id)
        }
        JournalRecord::Remove(id) => id.to_string(),
        JournalRecord::Link(link) => {
            format!("{} <-> {} at {}", link.inode, link.asset_id, link.path)
        }
        JournalRecord::Unlink(inode) => inode.to_string(),
        JournalRecord::LastSynced(at) => at.to_string(),
    }
}

/// Describes how a scan ended.
pub(crate) fn describe_end(end: &ScanEnd) -> String {
    match end {
        ScanEnd::Clean => "clean".to_string(),
        ScanEnd::TornTail { offset } => format!("torn tail at offset {offset}"),
        ScanEnd::Corrupt { offset, reason } => {
            format!("corrupt frame at offset {offset}: {reason}")
        }
    }
}

pub(crate) fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use mirrorsync_engine::{JournalStateStore, StateStore};
    use mirrorsync_protocol::{AssetId, Inode, Link, PendingAction, Timestamp};
    use std::path::Path;

    /// Writes a journal with churn: two actions, one of them removed, a
    /// link written twice and a watermark.
    pub(crate) fn seed(dir: &Path) -> PendingAction {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let store = JournalStateStore::open(dir).await.unwrap();
            let kept = PendingAction::create("docs/a.txt");
            let dropped = PendingAction::update("docs/b.txt");
            store.append_action(&kept).await.unwrap();
            store.append_action(&dropped).await.unwrap();
            store.remove_action(dropped.id).await.unwrap();

            let link = Link::new(
                Inode::new("42"),
                AssetId::new("asset-42"),
                "docs/c.txt",
                Timestamp::from_millis(10),
                Timestamp::from_millis(9),
            );
            store.link(&link).await.unwrap();
            store.link(&link.relocated("docs/d.txt")).await.unwrap();
            store
                .set_last_synced_at(Timestamp::from_millis(20))
                .await
                .unwrap();
            kept
        })
    }
}
