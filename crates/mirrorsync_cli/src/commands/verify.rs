//! Verify command implementation.

use super::{describe_end, load};
use mirrorsync_engine::{JournalState, ScanEnd};
use std::collections::HashSet;
use std::path::Path;

/// Verification result.
#[derive(Debug)]
pub struct VerifyResult {
    /// Number of valid frames.
    pub valid_records: usize,
    /// Bytes covered by valid frames.
    pub valid_len: u64,
    /// Journal size in bytes.
    pub size: u64,
    /// How the scan ended.
    pub end: ScanEnd,
    /// Problems in the replayed state.
    pub errors: Vec<String>,
    /// Findings that do not make the journal unusable.
    pub warnings: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        !matches!(self.end, ScanEnd::Corrupt { .. }) && self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying state directory at {:?}", dir);
    println!();

    let result = verify(dir)?;
    println!(
        "  Journal frames checked: {}, valid bytes: {} of {}",
        result.valid_records, result.valid_len, result.size
    );
    println!("  Scan ended: {}", describe_end(&result.end));
    for warning in &result.warnings {
        println!("    WARNING: {}", warning);
    }
    for error in &result.errors {
        println!("    ERROR: {}", error);
    }

    println!();
    if result.is_ok() {
        println!("✓ Journal verification passed");
        Ok(())
    } else {
        println!("✗ Journal verification failed");
        Err("Verification failed".into())
    }
}

pub(crate) fn verify(dir: &Path) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let (size, scan) = load(dir)?;
    let mut warnings = Vec::new();
    if let ScanEnd::TornTail { offset } = scan.end {
        warnings.push(format!(
            "incomplete frame at offset {}; it is truncated on next open",
            offset
        ));
    }

    let valid_records = scan.records.len();
    let state = JournalState::from_records(scan.records.into_iter().map(|(_, r)| r));
    let errors = check_state(&state);

    Ok(VerifyResult {
        valid_records,
        valid_len: scan.valid_len,
        size,
        end: scan.end,
        errors,
        warnings,
    })
}

/// Checks the replayed queue for actions that could never be applied.
fn check_state(state: &JournalState) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for action in &state.actions {
        if !seen.insert(action.id) {
            errors.push(format!("action {} is queued twice", action.id));
        }
        if let Err(e) = action.validate() {
            errors.push(format!("action {} is malformed: {}", action.id, e));
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::seed;
    use mirrorsync_engine::journal_path;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn healthy_journal_passes() {
        let dir = tempdir().unwrap();
        seed(dir.path());
        let result = verify(dir.path()).unwrap();
        assert!(result.is_ok());
        assert_eq!(result.valid_len, result.size);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn torn_tail_is_only_a_warning() {
        let dir = tempdir().unwrap();
        seed(dir.path());
        let mut file = OpenOptions::new()
            .append(true)
            .open(journal_path(dir.path()))
            .unwrap();
        file.write_all(b"MSJ1\x01").unwrap();

        let result = verify(dir.path()).unwrap();
        assert!(result.is_ok());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn flipped_byte_fails() {
        let dir = tempdir().unwrap();
        seed(dir.path());
        let path = journal_path(dir.path());
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[12] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let result = verify(dir.path()).unwrap();
        assert!(!result.is_ok());
    }
}
