//! Catch-up after startup or reconnection.
//!
//! Change notifications are not replayed for the time the engine was
//! stopped or the remote store was unreachable. Catch-up lists what changed
//! on both sides since the last complete sync and reconciles it: remote
//! changes first, then local ones.

use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::inbound::RemoteToLocal;
use crate::outbound::LocalToRemote;
use mirrorsync_protocol::Timestamp;
use tracing::{info, warn};

/// Outcome of one catch-up run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatchUpReport {
    /// When the run started; becomes the next watermark if the round is clean.
    pub started_at: Timestamp,
    /// Remote assets reconciled.
    pub pulled: usize,
    /// Local files pushed or queued.
    pub pushed: usize,
    /// Objects that failed to reconcile.
    pub errors: usize,
}

pub(crate) async fn run(
    ctx: &SyncContext,
    inbound: &RemoteToLocal,
    outbound: &LocalToRemote,
) -> SyncResult<CatchUpReport> {
    let since = ctx.state.last_synced_at().await?.unwrap_or(Timestamp::EPOCH);
    let mut report = CatchUpReport {
        started_at: Timestamp::now(),
        ..CatchUpReport::default()
    };
    info!(since = %since, "catch-up started");

    let mut cursor = None;
    loop {
        ctx.check_cancelled()?;
        let page = ctx
            .remote
            .list_assets(since, cursor.take(), ctx.config.catch_up_page_size)
            .await
            .map_err(|e| SyncError::destination("list", "/", e))?;
        for asset in &page.assets {
            match inbound.reconcile(asset, None).await {
                Ok(()) => report.pulled += 1,
                Err(e) if e.is_fatal() || e.is_unreachable() => return Err(e),
                Err(e) => {
                    report.errors += 1;
                    warn!(path = %asset.path, error = %e, "failed to reconcile remote asset");
                }
            }
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    let files = ctx
        .local
        .list_files(since)
        .await
        .map_err(|e| SyncError::destination("list", "/", e))?;
    for file in &files {
        ctx.check_cancelled()?;
        if ctx.queue.touches(&file.path).await {
            // Queued actions read the file when they are replayed.
            continue;
        }
        match outbound.reconcile_file(file).await {
            Ok(true) => report.pushed += 1,
            Ok(false) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                report.errors += 1;
                warn!(path = %file.path, error = %e, "failed to push local file");
            }
        }
    }

    info!(
        pulled = report.pulled,
        pushed = report.pushed,
        errors = report.errors,
        "catch-up finished"
    );
    Ok(report)
}
