//! Identity links between local files and remote assets.

use crate::types::{AssetId, Inode, Timestamp};
use serde::{Deserialize, Serialize};

/// A persisted correlation between one local file and one remote asset.
///
/// Links are keyed by both identities, so a local rename or a remote move
/// updates `path` without losing the pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Local identity.
    pub inode: Inode,
    /// Remote identity.
    pub asset_id: AssetId,
    /// Last known path, shared by both sides.
    pub path: String,
    /// Remote `updated_at` as of the last successful sync of this pair.
    pub remote_updated_at: Timestamp,
    /// Local modification time as of the last successful sync of this pair.
    pub local_modified_at: Timestamp,
}

impl Link {
    /// Creates a link.
    pub fn new(
        inode: Inode,
        asset_id: AssetId,
        path: impl Into<String>,
        remote_updated_at: Timestamp,
        local_modified_at: Timestamp,
    ) -> Self {
        Self {
            inode,
            asset_id,
            path: path.into(),
            remote_updated_at,
            local_modified_at,
        }
    }

    /// Returns a copy of this link relocated to `path`.
    ///
    /// Both sync watermarks are kept: a move does not sync content.
    #[must_use]
    pub fn relocated(&self, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..self.clone()
        }
    }

    /// Returns true if the remote side changed since this link was recorded.
    pub fn remote_changed_since_sync(&self, remote_updated_at: Timestamp) -> bool {
        remote_updated_at > self.remote_updated_at
    }

    /// Returns true if the local side changed since this link was recorded.
    pub fn local_changed_since_sync(&self, modified_at: Timestamp) -> bool {
        modified_at > self.local_modified_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_change_detection() {
        let link = Link::new(
            Inode::new("1"),
            AssetId::new("a1"),
            "a.txt",
            Timestamp::from_millis(100),
            Timestamp::from_millis(90),
        );
        assert!(!link.remote_changed_since_sync(Timestamp::from_millis(100)));
        assert!(link.remote_changed_since_sync(Timestamp::from_millis(101)));
        assert!(!link.local_changed_since_sync(Timestamp::from_millis(90)));
        assert!(link.local_changed_since_sync(Timestamp::from_millis(95)));
    }

    #[test]
    fn relocation_keeps_watermarks() {
        let link = Link::new(
            Inode::new("1"),
            AssetId::new("a1"),
            "docs/a.txt",
            Timestamp::from_millis(5),
            Timestamp::from_millis(4),
        );
        let moved = link.relocated("docs/b.txt");
        assert_eq!(moved.path, "docs/b.txt");
        assert_eq!(moved.asset_id, link.asset_id);
        assert_eq!(moved.remote_updated_at, link.remote_updated_at);
        assert_eq!(moved.local_modified_at, link.local_modified_at);
    }
}
