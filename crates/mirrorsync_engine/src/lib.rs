//! # Mirrorsync Engine
//!
//! Offline-first, bidirectional sync between a local directory tree and a
//! remote asset store.
//!
//! This crate provides:
//! - Direction handlers turning change events on either side into
//!   mutations on the other
//! - A durable action queue that records local changes while the remote
//!   store is unreachable and replays them in order on reconnect
//! - Echo suppression, so the engine's own writes are not synced back
//! - Catch-up over changes made while the engine was stopped or offline
//! - A file-backed journal for the queue and identity links
//! - In-memory collaborators for tests and embedding
//!
//! ## Architecture
//!
//! The engine talks to three collaborators through traits:
//! [`LocalFileSystem`], [`RemoteStore`] and [`StateStore`]. Each sync
//! round is **pull-then-push**:
//! 1. Catch up: reconcile remote changes, then local ones
//! 2. Drain the action queue in FIFO order
//! 3. Re-reconcile remote changes that waited behind queued actions
//!
//! ## Key Invariants
//!
//! - Changes to one path reach the remote store in the order they happened
//! - A queued action is removed only after it was applied
//! - Replaying an action twice has the same effect as once
//! - A conflict is decided once and reported once
//! - State storage failures stop the engine instead of losing changes

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod catchup;
mod config;
mod context;
mod drain;
mod echo;
mod engine;
mod error;
mod identity;
mod inbound;
mod journal;
mod memory;
mod outbound;
mod queue;
mod store;

pub use catchup::CatchUpReport;
pub use config::{RetryConfig, SyncConfig};
pub use context::{Notice, SyncStats};
pub use drain::{DrainReport, FailedAction};
pub use echo::EchoGuard;
pub use engine::{EngineState, RoundReport, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use identity::LinkTable;
pub use journal::{
    compute_crc32, journal_path, read_journal, scan, CompactStats, Journal, JournalRecord,
    JournalScan, JournalState, JournalStateStore, RecordType, ScanEnd, JOURNAL_MAGIC,
};
pub use memory::{MemoryFileSystem, MemoryRemoteStore, MemoryStateStore};
pub use queue::{ActionQueue, QueueGuard};
pub use store::{AssetPage, LocalFileSystem, RemoteStore, StateStore};
