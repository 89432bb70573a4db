//! Error types for the sync engine.

use mirrorsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while synchronizing.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The destination store cannot be reached.
    ///
    /// Handlers never surface this for live events; they queue instead.
    #[error("destination unreachable")]
    Unreachable,

    /// The object an operation refers to does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing object.
        what: String,
    },

    /// A queued action violates its shape invariants.
    #[error("malformed action {id}: {reason}")]
    MalformedAction {
        /// Identifier of the offending action.
        id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A destination operation failed.
    #[error("{operation} failed for {path}: {message}")]
    DestinationFailed {
        /// Operation that failed.
        operation: &'static str,
        /// Path the operation applied to.
        path: String,
        /// Underlying error message.
        message: String,
        /// Whether a later attempt may succeed.
        retryable: bool,
    },

    /// A collaborator's I/O or network call failed.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Queue or state storage is unavailable.
    #[error("queue storage error: {0}")]
    Queue(String),

    /// Invalid engine state transition.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Protocol value error.
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine is stopping.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a queue storage error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue(message.into())
    }

    /// Wraps a collaborator failure into a destination operation error.
    ///
    /// Unreachability, storage failures and cancellation keep their own
    /// variants since callers react to them differently.
    pub fn destination(operation: &'static str, path: impl Into<String>, source: SyncError) -> Self {
        match source {
            SyncError::Unreachable
            | SyncError::Queue(_)
            | SyncError::Cancelled
            | SyncError::DestinationFailed { .. } => source,
            other => Self::DestinationFailed {
                operation,
                path: path.into(),
                retryable: other.is_retryable(),
                message: other.to_string(),
            },
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. }
            | SyncError::DestinationFailed { retryable, .. } => *retryable,
            SyncError::Unreachable => true,
            SyncError::Io(_) => true,
            _ => false,
        }
    }

    /// Returns true if the destination object was missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound { .. })
    }

    /// Returns true if the destination store went away.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, SyncError::Unreachable)
    }

    /// Returns true if this error must stop the engine.
    ///
    /// Only queue storage failures are fatal; everything else is reported
    /// per event or per action.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Queue(_))
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::MalformedAction { id, reason } => Self::MalformedAction { id, reason },
            other => Self::Protocol(other),
        }
    }
}

/// Treats a missing object as success.
pub(crate) fn ignore_not_found<T>(result: SyncResult<T>) -> SyncResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(!SyncError::transport_fatal("quota exceeded").is_retryable());
        assert!(SyncError::Unreachable.is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::not_found("asset a1").is_retryable());
    }

    #[test]
    fn destination_wrapping() {
        let err = SyncError::destination(
            "update",
            "a.txt",
            SyncError::transport_retryable("timeout"),
        );
        assert!(matches!(
            err,
            SyncError::DestinationFailed {
                operation: "update",
                retryable: true,
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            "update failed for a.txt: transport error: timeout"
        );

        let err = SyncError::destination("update", "a.txt", SyncError::Unreachable);
        assert!(err.is_unreachable());

        let err = SyncError::destination("update", "a.txt", SyncError::queue("disk full"));
        assert!(err.is_fatal());
    }

    #[test]
    fn malformed_protocol_error_maps_to_own_variant() {
        let err: SyncError = ProtocolError::malformed_action("a1", "no target").into();
        assert!(matches!(err, SyncError::MalformedAction { .. }));

        let err: SyncError = ProtocolError::Decode("eof".into()).into();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn not_found_is_ignored() {
        assert_eq!(ignore_not_found::<u8>(Err(SyncError::not_found("x"))).unwrap(), None);
        assert_eq!(ignore_not_found(Ok(3)).unwrap(), Some(3));
        assert!(ignore_not_found::<u8>(Err(SyncError::Unreachable)).is_err());
    }

    #[test]
    fn only_queue_errors_are_fatal() {
        assert!(SyncError::queue("journal locked").is_fatal());
        assert!(!SyncError::transport_fatal("denied").is_fatal());
        assert!(!SyncError::Cancelled.is_fatal());
    }
}
