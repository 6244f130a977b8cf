//! Error types for the HQ handler.

use thiserror::Error;
use tillsync_engine::SyncError;
use tillsync_protocol::StoreId;

/// Result type for HQ operations.
pub type HqResult<T> = Result<T, HqError>;

/// Errors returned to a store by the HQ handler.
#[derive(Error, Debug)]
pub enum HqError {
    /// Malformed or oversized request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The store has no configuration at HQ.
    #[error("unknown store: {0}")]
    UnknownStore(StoreId),

    /// The store's sync is disabled at HQ.
    #[error("sync disabled for {0}")]
    StoreDisabled(StoreId),

    /// Engine failure.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl HqError {
    /// Returns true if the request itself was at fault.
    pub fn is_client_error(&self) -> bool {
        match self {
            HqError::InvalidRequest(_) | HqError::UnknownStore(_) | HqError::StoreDisabled(_) => {
                true
            }
            HqError::Sync(e) => e.is_permanent(),
        }
    }

    /// Returns true if the store may send the same request again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            HqError::StoreDisabled(_) => true,
            HqError::Sync(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Converts to the error a store's transport reports.
    pub fn into_sync_error(self) -> SyncError {
        match self {
            HqError::Sync(e) => e,
            HqError::UnknownStore(id) => SyncError::UnknownStore(id),
            other => {
                let retryable = other.is_retryable();
                SyncError::Transport {
                    message: other.to_string(),
                    retryable,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(HqError::InvalidRequest("too big".into()).is_client_error());
        assert!(HqError::UnknownStore(StoreId(4)).is_client_error());
        assert!(!HqError::Sync(SyncError::Timeout).is_client_error());
        assert!(HqError::Sync(SyncError::Timeout).is_retryable());
        assert!(HqError::StoreDisabled(StoreId(4)).is_retryable());
    }

    #[test]
    fn converts_for_transport() {
        let err = HqError::InvalidRequest("too big".into()).into_sync_error();
        assert!(matches!(err, SyncError::Transport { retryable: false, .. }));
        assert!(!err.is_retryable());

        let err = HqError::StoreDisabled(StoreId(2)).into_sync_error();
        assert!(err.is_retryable());

        let err = HqError::UnknownStore(StoreId(9)).into_sync_error();
        assert!(matches!(err, SyncError::UnknownStore(StoreId(9))));
    }
}
