//! Conflict detection and resolution.

use crate::types::Timestamp;

/// Which side of a conflict is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// The local version is pushed to the remote store.
    LocalWins,
    /// The remote version replaces the local file.
    RemoteWins,
}

/// A side effect the engine must carry out after a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    /// Proceed with the local-to-remote mutation.
    PushLocal,
    /// Download the remote version and overwrite the local file.
    OverwriteLocal,
    /// Surface a conflict notice to the presentation layer.
    NotifyConflict,
}

/// Both sides' timestamps for one logical file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInput {
    /// Path of the file.
    pub path: String,
    /// Local timestamp (see [`LocalTimestamp`]).
    pub local_time: Timestamp,
    /// Remote `updated_at`.
    pub remote_updated_at: Timestamp,
}

/// Result of a conflict decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The winning side.
    pub outcome: ConflictOutcome,
    /// Effects to carry out, in order.
    pub effects: Vec<SideEffect>,
}

impl Resolution {
    /// Returns true if the resolution asks for a conflict notice.
    pub fn notifies(&self) -> bool {
        self.effects.contains(&SideEffect::NotifyConflict)
    }
}

/// Decides which side of a diverging file wins.
///
/// A remote version that is newer than or as new as the local one wins:
/// the local file is overwritten and the conflict is reported upward, since
/// local edits can be recovered through the host's own history while remote
/// edits may not be. A strictly newer local version is pushed.
pub fn resolve_conflict(input: &ConflictInput) -> Resolution {
    if input.remote_updated_at >= input.local_time {
        Resolution {
            outcome: ConflictOutcome::RemoteWins,
            effects: vec![SideEffect::OverwriteLocal, SideEffect::NotifyConflict],
        }
    } else {
        Resolution {
            outcome: ConflictOutcome::LocalWins,
            effects: vec![SideEffect::PushLocal],
        }
    }
}

/// Which local timestamp is compared against the remote `updated_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalTimestamp {
    /// Content modification time (`mTime`).
    #[default]
    Modified,
    /// Metadata change time (`cTime`).
    Changed,
}

impl LocalTimestamp {
    /// Picks the configured timestamp from a local record.
    pub fn of(&self, file: &crate::LocalFileRecord) -> Timestamp {
        match self {
            LocalTimestamp::Modified => file.modified_at,
            LocalTimestamp::Changed => file.changed_at,
        }
    }
}

/// A conflict reported to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictNotice {
    /// Path of the file.
    pub path: String,
    /// Local timestamp that lost or won.
    pub local_time: Timestamp,
    /// Remote `updated_at`.
    pub remote_updated_at: Timestamp,
    /// The decision taken.
    pub outcome: ConflictOutcome,
    /// When the conflict was detected.
    pub detected_at: Timestamp,
}

impl ConflictNotice {
    /// Builds a notice from a decision.
    pub fn new(input: &ConflictInput, resolution: &Resolution) -> Self {
        Self {
            path: input.path.clone(),
            local_time: input.local_time,
            remote_updated_at: input.remote_updated_at,
            outcome: resolution.outcome,
            detected_at: Timestamp::now(),
        }
    }
}
