//! Suppression of change events caused by the engine's own writes.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Echo {
    Write { path: String, digest: [u8; 32] },
    Delete { path: String },
    Move { source: String, target: String },
}

/// A short-lived set of mutations the engine performed on the local tree.
///
/// Before an inbound handler writes, deletes or moves a local file it
/// registers the mutation here. The local event the filesystem raises for
/// it is then recognized by the outbound handler and dropped instead of
/// being synced back. Writes are keyed by path and content hash, so a user
/// edit made inside the window still gets through.
///
/// Entries stay live until they expire, since watchers may report a single
/// write more than once.
#[derive(Debug)]
pub struct EchoGuard {
    window: Duration,
    entries: Mutex<HashMap<Echo, Instant>>,
}

impl EchoGuard {
    /// Creates a guard whose entries live for `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a write of `data` to `path`.
    pub fn expect_write(&self, path: &str, data: &[u8]) {
        self.insert(Echo::Write {
            path: path.to_string(),
            digest: digest(data),
        });
    }

    /// Registers a deletion of `path`.
    pub fn expect_delete(&self, path: &str) {
        self.insert(Echo::Delete {
            path: path.to_string(),
        });
    }

    /// Registers a rename from `source` to `target`.
    pub fn expect_move(&self, source: &str, target: &str) {
        self.insert(Echo::Move {
            source: source.to_string(),
            target: target.to_string(),
        });
    }

    /// Returns true if writing `data` to `path` was the engine's own doing.
    pub fn is_write_echo(&self, path: &str, data: &[u8]) -> bool {
        self.contains(&Echo::Write {
            path: path.to_string(),
            digest: digest(data),
        })
    }

    /// Returns true if deleting `path` was the engine's own doing.
    pub fn is_delete_echo(&self, path: &str) -> bool {
        self.contains(&Echo::Delete {
            path: path.to_string(),
        })
    }

    /// Returns true if renaming `source` to `target` was the engine's own doing.
    pub fn is_move_echo(&self, source: &str, target: &str) -> bool {
        self.contains(&Echo::Move {
            source: source.to_string(),
            target: target.to_string(),
        })
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        purge(&mut entries, Instant::now());
        entries.len()
    }

    /// Returns true if no entries are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, echo: Echo) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        purge(&mut entries, now);
        entries.insert(echo, now + self.window);
    }

    fn contains(&self, echo: &Echo) -> bool {
        let mut entries = self.entries.lock();
        purge(&mut entries, Instant::now());
        entries.contains_key(echo)
    }
}

fn purge(entries: &mut HashMap<Echo, Instant>, now: Instant) {
    entries.retain(|_, expires| *expires > now);
}

fn digest(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_echo_matches_path_and_content() {
        let guard = EchoGuard::new(Duration::from_secs(2));
        guard.expect_write("a.txt", b"remote bytes");

        assert!(guard.is_write_echo("a.txt", b"remote bytes"));
        // Duplicate notifications for the same write are still echoes.
        assert!(guard.is_write_echo("a.txt", b"remote bytes"));
        assert!(!guard.is_write_echo("a.txt", b"user edit"));
        assert!(!guard.is_write_echo("b.txt", b"remote bytes"));
    }

    #[tokio::test]
    async fn delete_and_move_echoes() {
        let guard = EchoGuard::new(Duration::from_secs(2));
        guard.expect_delete("gone.txt");
        guard.expect_move("docs/a.txt", "docs/b.txt");

        assert!(guard.is_delete_echo("gone.txt"));
        assert!(!guard.is_delete_echo("other.txt"));
        assert!(guard.is_move_echo("docs/a.txt", "docs/b.txt"));
        assert!(!guard.is_move_echo("docs/b.txt", "docs/a.txt"));
        assert_eq!(guard.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let guard = EchoGuard::new(Duration::from_millis(100));
        guard.expect_write("a.txt", b"x");
        assert!(!guard.is_empty());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!guard.is_write_echo("a.txt", b"x"));
        assert!(guard.is_empty());
    }
}
