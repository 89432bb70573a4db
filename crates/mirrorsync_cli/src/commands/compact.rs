//! Compact command implementation.

use super::{format_size, load};
use mirrorsync_engine::{CompactStats, Journal, JournalRecord, JournalState};
use std::path::Path;
use tracing::info;

/// Runs the compact command.
///
/// Compaction takes the directory lock, so it fails while an engine has the
/// journal open.
pub fn run(dir: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Compacting journal at {:?}", dir);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let stats = analyze(dir)?;
    print_stats(&stats);

    if !dry_run {
        if stats.records_after < stats.records_before {
            println!();
            println!("Performing compaction...");
            let done = Journal::open(dir)?.compact()?;
            info!(records = done.records_after, bytes = done.bytes_after, "journal compacted");
            println!("✓ Compaction complete");
        } else {
            println!();
            println!("No compaction needed - journal holds only live records");
        }
    }

    Ok(())
}

/// Computes what compaction would do without touching the journal.
pub(crate) fn analyze(dir: &Path) -> Result<CompactStats, Box<dyn std::error::Error>> {
    let (size, scan) = load(dir)?;
    if !scan.is_intact() {
        return Err("Journal is corrupt; run verify for details".into());
    }
    let records_before = scan.records.len() as u64;
    let state = JournalState::from_records(scan.records.into_iter().map(|(_, r)| r));
    let live = state.live_records();

    let mut bytes_after = 0u64;
    for record in &live {
        bytes_after += JournalRecord::encode(record)?.len() as u64;
    }

    Ok(CompactStats {
        records_before,
        records_after: live.len() as u64,
        bytes_before: size,
        bytes_after,
    })
}

fn print_stats(stats: &CompactStats) {
    println!("Compaction Analysis:");
    println!("  Records before: {}", stats.records_before);
    println!("  Records after:  {}", stats.records_after);
    println!();
    println!("  Size before: {}", format_size(stats.bytes_before));
    println!("  Size after:  {}", format_size(stats.bytes_after));
    let saved = stats.bytes_before.saturating_sub(stats.bytes_after);
    println!(
        "  Space saved: {} ({:.1}%)",
        format_size(saved),
        if stats.bytes_before > 0 {
            (saved as f64 / stats.bytes_before as f64) * 100.0
        } else {
            0.0
        }
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::inspect::inspect;
    use crate::commands::testing::seed;
    use tempfile::tempdir;

    #[test]
    fn analysis_matches_compaction() {
        let dir = tempdir().unwrap();
        seed(dir.path());
        let before = inspect(dir.path(), true, true).unwrap();

        let predicted = analyze(dir.path()).unwrap();
        assert_eq!(predicted.records_before, 6);
        assert_eq!(predicted.records_after, 3);

        run(dir.path(), false).unwrap();
        let after = inspect(dir.path(), true, true).unwrap();
        assert_eq!(after.record_count, 3);
        assert_eq!(after.journal_size, predicted.bytes_after);
        assert_eq!(after.actions, before.actions);
        assert_eq!(after.links, before.links);
        assert_eq!(after.last_synced_at, before.last_synced_at);
    }

    #[test]
    fn dry_run_leaves_journal_alone() {
        let dir = tempdir().unwrap();
        seed(dir.path());
        run(dir.path(), true).unwrap();
        assert_eq!(inspect(dir.path(), false, false).unwrap().record_count, 6);
    }

    #[test]
    fn locked_journal_is_refused() {
        let dir = tempdir().unwrap();
        seed(dir.path());
        let _held = Journal::open(dir.path()).unwrap();
        assert!(run(dir.path(), false).is_err());
    }
}
