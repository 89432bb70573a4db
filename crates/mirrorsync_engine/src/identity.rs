//! Identity correlation between local inodes and remote asset IDs.

use mirrorsync_protocol::{AssetId, Inode, Link};
use std::collections::HashMap;

/// An in-memory table of [`Link`]s.
///
/// Each inode, asset ID and path appears in at most one link. Inserting a
/// link evicts every link it collides with on any of the three keys.
#[derive(Debug, Clone, Default)]
pub struct LinkTable {
    by_inode: HashMap<Inode, Link>,
}

impl LinkTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a link, returning the links it evicted.
    pub fn insert(&mut self, link: Link) -> Vec<Link> {
        let colliding: Vec<Inode> = self
            .by_inode
            .values()
            .filter(|l| {
                l.inode == link.inode || l.asset_id == link.asset_id || l.path == link.path
            })
            .map(|l| l.inode.clone())
            .collect();
        let evicted = colliding
            .iter()
            .filter_map(|inode| self.by_inode.remove(inode))
            .filter(|l| *l != link)
            .collect();
        self.by_inode.insert(link.inode.clone(), link);
        evicted
    }

    /// Removes the link for an inode.
    pub fn remove(&mut self, inode: &Inode) -> Option<Link> {
        self.by_inode.remove(inode)
    }

    /// Returns the link for an inode.
    pub fn by_inode(&self, inode: &Inode) -> Option<&Link> {
        self.by_inode.get(inode)
    }

    /// Returns the link for an asset.
    pub fn by_asset(&self, id: &AssetId) -> Option<&Link> {
        self.by_inode.values().find(|l| l.asset_id == *id)
    }

    /// Returns the link at a path.
    pub fn by_path(&self, path: &str) -> Option<&Link> {
        self.by_inode.values().find(|l| l.path == path)
    }

    /// Iterates over all links in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.by_inode.values()
    }

    /// Returns the number of links.
    pub fn len(&self) -> usize {
        self.by_inode.len()
    }

    /// Returns true if there are no links.
    pub fn is_empty(&self) -> bool {
        self.by_inode.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorsync_protocol::Timestamp;

    fn link(inode: &str, asset: &str, path: &str) -> Link {
        Link::new(
            Inode::new(inode),
            AssetId::new(asset),
            path,
            Timestamp::from_millis(1),
            Timestamp::from_millis(1),
        )
    }

    #[test]
    fn lookups_by_each_key() {
        let mut table = LinkTable::new();
        table.insert(link("1", "a1", "a.txt"));
        table.insert(link("2", "a2", "b.txt"));

        assert_eq!(table.len(), 2);
        assert_eq!(table.by_inode(&Inode::new("1")).unwrap().path, "a.txt");
        assert_eq!(table.by_asset(&AssetId::new("a2")).unwrap().path, "b.txt");
        assert_eq!(table.by_path("a.txt").unwrap().asset_id, AssetId::new("a1"));
        assert!(table.by_path("c.txt").is_none());
    }

    #[test]
    fn insert_evicts_collisions() {
        let mut table = LinkTable::new();
        table.insert(link("1", "a1", "a.txt"));
        table.insert(link("2", "a2", "b.txt"));

        // Same asset under a new inode, at the other link's path.
        let evicted = table.insert(link("3", "a1", "b.txt"));
        assert_eq!(evicted.len(), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.by_asset(&AssetId::new("a1")).unwrap().inode, Inode::new("3"));
    }

    #[test]
    fn reinserting_same_link_evicts_nothing() {
        let mut table = LinkTable::new();
        table.insert(link("1", "a1", "a.txt"));
        assert!(table.insert(link("1", "a1", "a.txt")).is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_by_inode() {
        let mut table = LinkTable::new();
        table.insert(link("1", "a1", "a.txt"));
        assert!(table.remove(&Inode::new("1")).is_some());
        assert!(table.is_empty());
        assert!(table.remove(&Inode::new("1")).is_none());
    }
}
