//! Pending actions queued while the remote store is unreachable.

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{ActionId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a pending action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    /// Create the remote asset from the local file.
    Create,
    /// Overwrite the remote asset data from the local file.
    Update,
    /// Delete the remote asset.
    Delete,
    /// Retarget the remote asset from `path` to `target_path`.
    Move,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Create => "CREATE",
            ActionKind::Update => "UPDATE",
            ActionKind::Delete => "DELETE",
            ActionKind::Move => "MOVE",
        };
        f.write_str(name)
    }
}

/// A queued intent to mutate the remote store.
///
/// Actions never carry file bytes: replaying an action re-reads the local
/// file at replay time, so the latest content is always what gets uploaded.
///
/// # Invariants
///
/// - `target_path` is present if and only if `kind` is [`ActionKind::Move`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAction {
    /// Unique action ID.
    pub id: ActionId,
    /// Action kind.
    pub kind: ActionKind,
    /// Path the action applies to (source path for moves).
    pub path: String,
    /// Destination path for moves.
    pub target_path: Option<String>,
    /// When the action was queued.
    pub enqueued_at: Timestamp,
}

impl PendingAction {
    fn new(kind: ActionKind, path: String, target_path: Option<String>) -> Self {
        Self {
            id: ActionId::new(),
            kind,
            path,
            target_path,
            enqueued_at: Timestamp::now(),
        }
    }

    /// Creates a create action.
    pub fn create(path: impl Into<String>) -> Self {
        Self::new(ActionKind::Create, path.into(), None)
    }

    /// Creates an update action.
    pub fn update(path: impl Into<String>) -> Self {
        Self::new(ActionKind::Update, path.into(), None)
    }

    /// Creates a delete action.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(ActionKind::Delete, path.into(), None)
    }

    /// Creates a move action.
    pub fn move_to(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(ActionKind::Move, source.into(), Some(target.into()))
    }

    /// Overrides the enqueue time.
    #[must_use]
    pub fn enqueued_at(mut self, at: Timestamp) -> Self {
        self.enqueued_at = at;
        self
    }

    /// Returns the path the local object lives at once this action applies.
    ///
    /// This is `target_path` for moves and `path` otherwise. Malformed moves
    /// fall back to `path`.
    #[must_use]
    pub fn current_path(&self) -> &str {
        match (&self.kind, &self.target_path) {
            (ActionKind::Move, Some(target)) => target,
            _ => &self.path,
        }
    }

    /// Checks the action's shape.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.path.is_empty() {
            return Err(ProtocolError::malformed_action(self.id, "empty path"));
        }
        match (self.kind, &self.target_path) {
            (ActionKind::Move, None) => Err(ProtocolError::malformed_action(
                self.id,
                "move action is missing its target path",
            )),
            (ActionKind::Move, Some(target)) if target.is_empty() => Err(
                ProtocolError::malformed_action(self.id, "move action has an empty target path"),
            ),
            (ActionKind::Move, Some(_)) => Ok(()),
            (kind, Some(_)) => Err(ProtocolError::malformed_action(
                self.id,
                format!("{kind} action carries a target path"),
            )),
            (_, None) => Ok(()),
        }
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes from CBOR bytes.
    ///
    /// Decoding does not validate; a structurally valid but malformed action
    /// is returned as-is so it can be reported when replayed.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

impl fmt::Display for PendingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target_path {
            Some(target) => write!(f, "{} {} -> {}", self.kind, self.path, target),
            None => write!(f, "{} {}", self.kind, self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_requires_target() {
        let mut action = PendingAction::move_to("docs/a.txt", "docs/b.txt");
        assert!(action.validate().is_ok());
        assert_eq!(action.current_path(), "docs/b.txt");

        action.target_path = None;
        let err = action.validate().unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedAction { .. }));
        assert_eq!(action.current_path(), "docs/a.txt");
    }

    #[test]
    fn non_move_rejects_target() {
        let mut action = PendingAction::update("a.txt");
        action.target_path = Some("b.txt".into());
        assert!(action.validate().is_err());
    }

    #[test]
    fn empty_path_is_malformed() {
        assert!(PendingAction::delete("").validate().is_err());
        assert!(PendingAction::move_to("a", "").validate().is_err());
    }

    #[test]
    fn encode_decode_preserves_fields() {
        let action =
            PendingAction::move_to("docs/a.txt", "docs/b.txt").enqueued_at(Timestamp::from_millis(7));
        let bytes = action.encode().unwrap();
        let decoded = PendingAction::decode(&bytes).unwrap();
        assert_eq!(decoded, action);
    }

    #[test]
    fn decode_keeps_malformed_shape() {
        let mut action = PendingAction::move_to("a", "b");
        action.target_path = None;
        let decoded = PendingAction::decode(&action.encode().unwrap()).unwrap();
        assert!(decoded.validate().is_err());
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(matches!(
            PendingAction::decode(&[0xff, 0x00, 0x13]),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn display() {
        assert_eq!(PendingAction::create("a.txt").to_string(), "CREATE a.txt");
        assert_eq!(
            PendingAction::move_to("a.txt", "b.txt").to_string(),
            "MOVE a.txt -> b.txt"
        );
    }
}
