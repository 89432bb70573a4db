//! Dump journal command implementation.

use super::{describe_end, load, record_label, summarize};
use mirrorsync_engine::ScanEnd;
use serde::Serialize;
use std::path::Path;

/// Journal record representation for output.
#[derive(Debug, Serialize)]
pub struct RecordInfo {
    /// Offset of the frame in the journal file.
    pub offset: u64,
    /// Record type.
    pub record_type: &'static str,
    /// Payload description.
    pub summary: String,
}

/// Runs the dump-journal command.
pub fn run(
    dir: &Path,
    limit: Option<usize>,
    start_offset: u64,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let (_, scan) = load(dir)?;
    let records = select(
        scan.records.iter().map(|(offset, record)| RecordInfo {
            offset: *offset,
            record_type: record_label(record.record_type()),
            summary: summarize(record),
        }),
        start_offset,
        limit,
    );

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        _ => {
            print_text_output(&records, &scan.end);
        }
    }

    Ok(())
}

fn select(
    records: impl Iterator<Item = RecordInfo>,
    start_offset: u64,
    limit: Option<usize>,
) -> Vec<RecordInfo> {
    records
        .skip_while(|r| r.offset < start_offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

fn print_text_output(records: &[RecordInfo], end: &ScanEnd) {
    println!("Journal Records ({} shown)", records.len());
    println!("=====================");
    println!();

    for record in records {
        println!("[{:08}] {:10} {}", record.offset, record.record_type, record.summary);
    }

    if *end != ScanEnd::Clean {
        println!();
        println!("Scan stopped: {}", describe_end(end));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(offset: u64) -> RecordInfo {
        RecordInfo {
            offset,
            record_type: "APPEND",
            summary: String::new(),
        }
    }

    #[test]
    fn offset_and_limit_select_a_window() {
        let all = || (0..5).map(|i| info(i * 10));
        let picked = select(all(), 15, Some(2));
        assert_eq!(
            picked.iter().map(|r| r.offset).collect::<Vec<_>>(),
            vec![20, 30]
        );
        assert_eq!(select(all(), 0, None).len(), 5);
    }
}
