//! Error types for the sync engine.

use crate::ItemId;
use thiserror::Error;

/// Failure classes used to decide how a failed operation is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transient; retried up to `max_retries`
    Network,
    /// Stale write; routed to the conflict resolver
    Conflict,
    /// Payload rejected by the server; terminal
    Validation,
    /// Persistent storage failure; the engine keeps running in memory
    Storage,
    /// Item could not be fingerprinted; terminal
    Hash,
}

/// Errors reported by a [`RemoteService`](crate::RemoteService).
///
/// Staleness must be signalled as [`RemoteError::Conflict`], distinct from a
/// generic failure, so the engine can route it to conflict resolution.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("stale write rejected for item {0}")]
    Conflict(ItemId),

    #[error("payload rejected: {0}")]
    Validation(String),

    #[error("item not found: {0}")]
    NotFound(ItemId),
}

impl RemoteError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::Network(_) => ErrorKind::Network,
            RemoteError::Conflict(_) => ErrorKind::Conflict,
            RemoteError::Validation(_) | RemoteError::NotFound(_) => ErrorKind::Validation,
        }
    }
}

/// Errors from the durable storage layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// An item could not be turned into a fingerprint.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HashError {
    #[error("item is not serializable: {0}")]
    NotSerializable(String),
}

/// All possible errors from the sync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Hash(#[from] HashError),

    #[error("item not in cache: {0}")]
    UnknownItem(ItemId),

    #[error("no pending conflict for item: {0}")]
    ConflictNotFound(ItemId),

    #[error("merge requested but no merge function is configured")]
    MergeUnavailable,

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("engine has been shut down")]
    ShutDown,
}

impl Error {
    /// The failure class, if this error maps onto one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Remote(e) => Some(e.kind()),
            Error::Storage(_) | Error::InvalidSnapshot(_) => Some(ErrorKind::Storage),
            Error::Hash(_) => Some(ErrorKind::Hash),
            _ => None,
        }
    }

    /// Whether an operation failing with this error may be retried automatically.
    pub fn is_retryable(&self) -> bool {
        self.kind() == Some(ErrorKind::Network)
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::UnknownItem("lesson-1".into());
        assert_eq!(err.to_string(), "item not in cache: lesson-1");

        let err = Error::from(RemoteError::Conflict("lesson-1".into()));
        assert_eq!(err.to_string(), "stale write rejected for item lesson-1");

        let err = Error::from(HashError::NotSerializable("key must be a string".into()));
        assert_eq!(
            err.to_string(),
            "item is not serializable: key must be a string"
        );
    }

    #[test]
    fn classification() {
        assert!(Error::from(RemoteError::Network("timeout".into())).is_retryable());
        assert!(!Error::from(RemoteError::Validation("title".into())).is_retryable());
        assert_eq!(
            Error::from(RemoteError::NotFound("x".into())).kind(),
            Some(ErrorKind::Validation)
        );
        assert_eq!(
            Error::from(StorageError::Io("disk full".into())).kind(),
            Some(ErrorKind::Storage)
        );
        assert_eq!(Error::ShutDown.kind(), None);
    }

    #[test]
    fn io_error_converts_to_storage_error() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StorageError = io.into();
        assert!(matches!(err, StorageError::Io(msg) if msg.contains("denied")));
    }
}
