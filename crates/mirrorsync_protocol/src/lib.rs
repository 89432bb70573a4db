//! # Mirrorsync Protocol
//!
//! Value types and pure policy for Mirrorsync.
//!
//! This crate provides:
//! - Store records ([`LocalFileRecord`], [`RemoteAssetRecord`]) and
//!   normalized [`ChangeEvent`]s
//! - [`PendingAction`]s queued while the remote store is unreachable
//! - [`PendingQueue`], which compacts redundant intents per path
//! - [`resolve_conflict`], the conflict decision function
//! - Identity [`Link`]s between local inodes and remote asset IDs
//!
//! This is a pure crate with no I/O operations. Everything here is
//! deterministic apart from ID generation and `Timestamp::now()`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod action;
mod conflict;
mod error;
mod event;
mod link;
mod queue;
mod types;

pub use action::{ActionKind, PendingAction};
pub use conflict::{
    resolve_conflict, ConflictInput, ConflictNotice, ConflictOutcome, LocalTimestamp, Resolution,
    SideEffect,
};
pub use error::{ProtocolError, ProtocolResult};
pub use event::{ChangeEvent, ChangeKind, LocalFileRecord, ObjectRef, Origin, RemoteAssetRecord};
pub use link::Link;
pub use queue::{CompactionPlan, PendingQueue, QueueOp};
pub use types::{ActionId, AssetId, Inode, Timestamp};
