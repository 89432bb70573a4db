//! Store records and normalized change events.

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{AssetId, Inode, Timestamp};
use serde::{Deserialize, Serialize};

/// Snapshot of a file on the local filesystem.
///
/// The identity key is `inode`; `path` changes on rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFileRecord {
    /// Path relative to the synchronized root.
    pub path: String,
    /// Filesystem identity.
    pub inode: Inode,
    /// Content modification time.
    pub modified_at: Timestamp,
    /// Metadata change time.
    pub changed_at: Timestamp,
}

impl LocalFileRecord {
    /// Creates a new local file record.
    pub fn new(
        path: impl Into<String>,
        inode: Inode,
        modified_at: Timestamp,
        changed_at: Timestamp,
    ) -> Self {
        Self {
            path: path.into(),
            inode,
            modified_at,
            changed_at,
        }
    }

    /// Returns a copy of this record relocated to `path`.
    #[must_use]
    pub fn with_path(&self, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..self.clone()
        }
    }
}

/// Snapshot of an asset in the remote store.
///
/// The identity key is `id`; `path` is mutable and is what correlates an
/// asset with a local file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAssetRecord {
    /// Immutable asset identifier.
    pub id: AssetId,
    /// Logical path of the asset.
    pub path: String,
    /// Creation time on the remote store.
    pub created_at: Timestamp,
    /// Last update time on the remote store.
    pub updated_at: Timestamp,
    /// Download location.
    pub url: String,
}

/// Which store an object or event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// The local filesystem.
    Local,
    /// The remote asset store.
    Remote,
}

/// A reference to an object on its origin store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectRef {
    /// A local file.
    Local(LocalFileRecord),
    /// A remote asset.
    Remote(RemoteAssetRecord),
}

impl ObjectRef {
    /// Returns the path of the referenced object.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            ObjectRef::Local(file) => &file.path,
            ObjectRef::Remote(asset) => &asset.path,
        }
    }

    /// Returns the store the object lives on.
    #[must_use]
    pub fn origin(&self) -> Origin {
        match self {
            ObjectRef::Local(_) => Origin::Local,
            ObjectRef::Remote(_) => Origin::Remote,
        }
    }

    /// Returns the local record, if this is a local reference.
    #[must_use]
    pub fn as_local(&self) -> Option<&LocalFileRecord> {
        match self {
            ObjectRef::Local(file) => Some(file),
            ObjectRef::Remote(_) => None,
        }
    }

    /// Returns the remote record, if this is a remote reference.
    #[must_use]
    pub fn as_remote(&self) -> Option<&RemoteAssetRecord> {
        match self {
            ObjectRef::Remote(asset) => Some(asset),
            ObjectRef::Local(_) => None,
        }
    }
}

/// Kind of change observed on a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Object appeared.
    Created,
    /// Object content changed.
    Updated,
    /// Object disappeared.
    Deleted,
    /// Object changed path.
    Moved,
}

/// A change notification from one of the two stores.
///
/// Events are transient: each is consumed exactly once by a direction
/// handler and is never persisted. Offline handling turns an event into a
/// [`PendingAction`](crate::PendingAction) instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// What happened.
    pub kind: ChangeKind,
    /// The object as it was identified when the change happened.
    pub source: ObjectRef,
    /// For moves, the object at its new location.
    pub target: Option<ObjectRef>,
    /// When the adapter observed the change.
    pub observed_at: Timestamp,
}

impl ChangeEvent {
    /// Creates a created event.
    pub fn created(source: ObjectRef) -> Self {
        Self::new(ChangeKind::Created, source, None)
    }

    /// Creates an updated event.
    pub fn updated(source: ObjectRef) -> Self {
        Self::new(ChangeKind::Updated, source, None)
    }

    /// Creates a deleted event.
    pub fn deleted(source: ObjectRef) -> Self {
        Self::new(ChangeKind::Deleted, source, None)
    }

    /// Creates a moved event.
    pub fn moved(source: ObjectRef, target: ObjectRef) -> Self {
        Self::new(ChangeKind::Moved, source, Some(target))
    }

    fn new(kind: ChangeKind, source: ObjectRef, target: Option<ObjectRef>) -> Self {
        Self {
            kind,
            source,
            target,
            observed_at: Timestamp::now(),
        }
    }

    /// Overrides the observation time.
    #[must_use]
    pub fn observed_at(mut self, at: Timestamp) -> Self {
        self.observed_at = at;
        self
    }

    /// Returns the origin store of this event.
    #[must_use]
    pub fn origin(&self) -> Origin {
        self.source.origin()
    }

    /// Returns the path the event is about.
    ///
    /// For moves this is the source path.
    #[must_use]
    pub fn path(&self) -> &str {
        self.source.path()
    }

    /// Returns the target path of a move.
    #[must_use]
    pub fn target_path(&self) -> Option<&str> {
        self.target.as_ref().map(ObjectRef::path)
    }

    /// Checks the event's shape.
    ///
    /// A move must carry a target on the same store as its source, and
    /// non-move events must not carry one.
    pub fn validate(&self) -> ProtocolResult<()> {
        match (&self.kind, &self.target) {
            (ChangeKind::Moved, None) => Err(ProtocolError::MalformedEvent(format!(
                "moved event for {} has no target",
                self.path()
            ))),
            (ChangeKind::Moved, Some(target)) if target.origin() != self.origin() => {
                Err(ProtocolError::MalformedEvent(format!(
                    "moved event for {} mixes local and remote references",
                    self.path()
                )))
            }
            (ChangeKind::Moved, Some(_)) => Ok(()),
            (_, Some(_)) => Err(ProtocolError::MalformedEvent(format!(
                "{:?} event for {} carries a target",
                self.kind,
                self.path()
            ))),
            (_, None) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(path: &str) -> ObjectRef {
        ObjectRef::Local(LocalFileRecord::new(
            path,
            Inode::new("42"),
            Timestamp::from_millis(10),
            Timestamp::from_millis(11),
        ))
    }

    fn remote(path: &str) -> ObjectRef {
        ObjectRef::Remote(RemoteAssetRecord {
            id: AssetId::new("asset-1"),
            path: path.into(),
            created_at: Timestamp::from_millis(1),
            updated_at: Timestamp::from_millis(2),
            url: format!("https://assets.example.com/{path}"),
        })
    }

    #[test]
    fn event_accessors() {
        let event = ChangeEvent::moved(local("docs/a.txt"), local("docs/b.txt"));
        assert_eq!(event.origin(), Origin::Local);
        assert_eq!(event.path(), "docs/a.txt");
        assert_eq!(event.target_path(), Some("docs/b.txt"));
        assert!(event.validate().is_ok());
    }

    #[test]
    fn moved_without_target_is_malformed() {
        let mut event = ChangeEvent::moved(local("a"), local("b"));
        event.target = None;
        assert!(matches!(
            event.validate(),
            Err(ProtocolError::MalformedEvent(_))
        ));
    }

    #[test]
    fn moved_across_origins_is_malformed() {
        let event = ChangeEvent::moved(local("a"), remote("b"));
        assert!(event.validate().is_err());
    }

    #[test]
    fn non_move_with_target_is_malformed() {
        let mut event = ChangeEvent::updated(remote("a"));
        event.target = Some(remote("b"));
        assert!(event.validate().is_err());
    }

    #[test]
    fn with_path_keeps_identity() {
        let record = LocalFileRecord::new(
            "a.txt",
            Inode::new("7"),
            Timestamp::from_millis(1),
            Timestamp::from_millis(1),
        );
        let moved = record.with_path("b.txt");
        assert_eq!(moved.inode, record.inode);
        assert_eq!(moved.path, "b.txt");
    }
}
