//! Error types for the sync engine.

use thiserror::Error;
use tillsync_protocol::{BatchDirection, ConflictId, EntityType, ProtocolError, QueueItemId, StoreId};
use tillsync_storage::StorageError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// How the engine reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff.
    Transient,
    /// Never retried; the item is dead-lettered with the detail.
    Permanent,
    /// The retry budget is spent.
    Exhausted,
    /// Data divergence, routed to the resolver.
    Conflict,
    /// A local fault (storage, bad state); the cycle aborts.
    Internal,
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Transport call timed out.
    #[error("operation timed out")]
    Timeout,

    /// Malformed or incompatible message.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Journal or backend failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O outside the journal (config file, lock file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The local repository rejected a read or write.
    #[error("repository error: {message}")]
    Repository {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// No rule exists for the entity type.
    #[error("unknown entity type: {0}")]
    UnknownEntityType(EntityType),

    /// The rule does not allow this direction.
    #[error("{entity_type} does not sync in direction {direction:?}")]
    DirectionNotAllowed {
        /// Entity type.
        entity_type: EntityType,
        /// Rejected direction.
        direction: BatchDirection,
    },

    /// The rule is disabled, so new changes are not accepted.
    #[error("sync rule for {0} is disabled")]
    RuleDisabled(EntityType),

    /// No configuration exists for the store.
    #[error("unknown store: {0}")]
    UnknownStore(StoreId),

    /// A row was not found.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Row kind.
        kind: &'static str,
        /// Row id.
        id: u64,
    },

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// The conflict is already resolved and immutable.
    #[error("{0} is already resolved")]
    ConflictAlreadyResolved(ConflictId),

    /// A manual resolution was attempted without naming the user.
    #[error("manual resolution of {0} requires a resolving user")]
    MissingResolver(ConflictId),

    /// A queue item used its whole retry budget.
    #[error("{item} failed after {attempts} attempts")]
    RetriesExhausted {
        /// Queue item.
        item: QueueItemId,
        /// Attempts made.
        attempts: u32,
    },

    /// The operation was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
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

    /// Creates a repository error.
    pub fn repository(message: impl Into<String>, retryable: bool) -> Self {
        Self::Repository {
            message: message.into(),
            retryable,
        }
    }

    /// Classifies the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Transport { retryable, .. } | SyncError::Repository { retryable, .. } => {
                if *retryable {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            SyncError::Timeout => ErrorClass::Transient,
            SyncError::Protocol(_)
            | SyncError::UnknownEntityType(_)
            | SyncError::DirectionNotAllowed { .. }
            | SyncError::RuleDisabled(_)
            | SyncError::UnknownStore(_) => ErrorClass::Permanent,
            SyncError::RetriesExhausted { .. } => ErrorClass::Exhausted,
            SyncError::ConflictAlreadyResolved(_) | SyncError::MissingResolver(_) => {
                ErrorClass::Conflict
            }
            SyncError::Storage(_)
            | SyncError::Io(_)
            | SyncError::NotFound { .. }
            | SyncError::InvalidStateTransition { .. }
            | SyncError::Cancelled
            | SyncError::Config(_) => ErrorClass::Internal,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Returns true if retrying cannot help.
    pub fn is_permanent(&self) -> bool {
        self.class() == ErrorClass::Permanent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("certificate rejected").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::repository("db busy", true).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn classification() {
        let schema = SyncError::from(ProtocolError::SchemaMismatch {
            expected: 1,
            found: 2,
        });
        assert_eq!(schema.class(), ErrorClass::Permanent);
        assert!(schema.is_permanent());
        assert_eq!(
            SyncError::UnknownEntityType(EntityType::new("Payroll")).class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            SyncError::RetriesExhausted {
                item: QueueItemId(1),
                attempts: 3
            }
            .class(),
            ErrorClass::Exhausted
        );
        assert_eq!(
            SyncError::ConflictAlreadyResolved(ConflictId(4)).class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            SyncError::Storage(StorageError::EntryTooLarge(1)).class(),
            ErrorClass::Internal
        );
    }

    #[test]
    fn error_display() {
        let err = SyncError::NotFound {
            kind: "queue item",
            id: 9,
        };
        assert_eq!(err.to_string(), "queue item 9 not found");

        let err = SyncError::MissingResolver(ConflictId(3));
        assert!(err.to_string().contains("conflict-3"));
    }
}
