//! Error types for protocol values.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while validating or decoding protocol values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A pending action violates its shape invariants.
    #[error("malformed action {id}: {reason}")]
    MalformedAction {
        /// Identifier of the offending action.
        id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A change event violates its shape invariants.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Encoding failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// Decoding failed.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ProtocolError {
    /// Creates a malformed action error.
    pub fn malformed_action(id: impl ToString, reason: impl Into<String>) -> Self {
        Self::MalformedAction {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::malformed_action("a1", "move without target path");
        assert_eq!(err.to_string(), "malformed action a1: move without target path");

        let err = ProtocolError::MalformedEvent("moved event has no target".into());
        assert_eq!(err.to_string(), "malformed event: moved event has no target");
    }
}
