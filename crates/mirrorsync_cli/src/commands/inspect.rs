//! Inspect command implementation.

use super::{describe_end, format_size, load};
use mirrorsync_engine::JournalState;
use mirrorsync_protocol::{Link, PendingAction, Timestamp};
use serde::Serialize;
use std::path::Path;

/// State directory inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// State directory path.
    pub path: String,
    /// Journal file size in bytes.
    pub journal_size: u64,
    /// Records in the journal.
    pub record_count: usize,
    /// Records a compacted journal would keep.
    pub live_record_count: usize,
    /// Queued actions awaiting replay.
    pub pending_actions: usize,
    /// Identity links.
    pub link_count: usize,
    /// Catch-up watermark.
    pub last_synced_at: Option<Timestamp>,
    /// How the journal scan ended.
    pub tail: String,
    /// Pending actions in replay order (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<PendingAction>>,
    /// Identity links (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<Link>>,
}

/// Runs the inspect command.
pub fn run(
    dir: &Path,
    show_actions: bool,
    show_links: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(dir, show_actions, show_links)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

pub(crate) fn inspect(
    dir: &Path,
    show_actions: bool,
    show_links: bool,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let (journal_size, scan) = load(dir)?;
    let record_count = scan.records.len();
    let state = JournalState::from_records(scan.records.into_iter().map(|(_, r)| r));

    let mut links: Vec<Link> = state.links.iter().cloned().collect();
    links.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(InspectResult {
        path: dir.display().to_string(),
        journal_size,
        record_count,
        live_record_count: state.live_records().len(),
        pending_actions: state.actions.len(),
        link_count: links.len(),
        last_synced_at: state.last_synced_at,
        tail: describe_end(&scan.end),
        actions: show_actions.then(|| state.actions.clone()),
        links: show_links.then_some(links),
    })
}

fn print_text_output(result: &InspectResult) {
    println!("Mirrorsync State Inspection");
    println!("===========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Journal:");
    println!("  Size:          {}", format_size(result.journal_size));
    println!("  Records:       {}", result.record_count);
    println!("  Live records:  {}", result.live_record_count);
    println!("  Tail:          {}", result.tail);
    println!();
    println!("State:");
    println!("  Pending actions: {}", result.pending_actions);
    println!("  Links:           {}", result.link_count);
    match result.last_synced_at {
        Some(at) => println!("  Last synced at:  {}", at),
        None => println!("  Last synced at:  never"),
    }

    if let Some(actions) = &result.actions {
        println!();
        println!("Pending actions:");
        for (position, action) in actions.iter().enumerate() {
            println!("  {:>4}. {} (queued {})", position + 1, action, action.enqueued_at);
        }
    }

    if let Some(links) = &result.links {
        println!();
        println!("Links:");
        for link in links {
            println!("  {} -> {} (inode {})", link.path, link.asset_id, link.inode);
        }
    }
}
