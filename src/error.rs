use std::io;
use thiserror::Error;

use crate::config::ConfigError;

/// Main error type for nstore operations
#[derive(Error, Debug)]
pub enum NstoreError {
    #[error("Malformed URI {uri:?}: {reason}")]
    MalformedUri { uri: String, reason: String },

    #[error("Unsupported mode: {mode}; must be one of {allowed}")]
    InvalidMode { mode: String, allowed: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Cache sync failed for {uri}: {message}")]
    CacheSync { uri: String, message: String },

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl NstoreError {
    pub(crate) fn malformed(uri: &str, reason: impl Into<String>) -> Self {
        NstoreError::MalformedUri {
            uri: uri.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether repeating the same call may succeed without caller action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NstoreError::BackendUnavailable(_) | NstoreError::CacheSync { .. }
        )
    }

    /// Classify a local I/O error against the path it concerns.
    ///
    /// `NotFound` keeps its own kind so callers can branch on it regardless
    /// of which backend produced it; everything else stays an I/O error.
    pub(crate) fn from_io(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => NstoreError::NotFound(path.to_string()),
            _ => NstoreError::Io(err),
        }
    }

    /// Wrap a transfer failure that happened while syncing a mirror.
    ///
    /// Errors that need caller action (missing object, bad credentials)
    /// pass through unchanged.
    pub(crate) fn into_cache_sync(self, uri: &str) -> Self {
        match self {
            NstoreError::NotFound(_)
            | NstoreError::Auth(_)
            | NstoreError::MalformedUri { .. }
            | NstoreError::CacheSync { .. } => self,
            other => NstoreError::CacheSync {
                uri: uri.to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Stream errors may carry an already classified `NstoreError` as their
/// payload; that error is recovered instead of being reported as I/O.
impl From<io::Error> for NstoreError {
    fn from(err: io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<NstoreError>()) {
            return NstoreError::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<NstoreError>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => NstoreError::Io(io::Error::other(other)),
            None => NstoreError::Backend("stream error without detail".to_string()),
        }
    }
}

/// Result type alias for nstore operations
pub type Result<T> = std::result::Result<T, NstoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(NstoreError::BackendUnavailable("timeout".into()).is_retryable());
        assert!(NstoreError::CacheSync {
            uri: "s3://b/k".into(),
            message: "reset".into()
        }
        .is_retryable());
        assert!(!NstoreError::Auth("denied".into()).is_retryable());
        assert!(!NstoreError::NotFound("x".into()).is_retryable());
        assert!(!NstoreError::malformed("ftp://x", "unsupported scheme").is_retryable());
    }

    #[test]
    fn test_from_io_keeps_not_found() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            NstoreError::from_io(err, "a/b.txt"),
            NstoreError::NotFound(p) if p == "a/b.txt"
        ));

        let err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(
            NstoreError::from_io(err, "a/b.txt"),
            NstoreError::Io(_)
        ));
    }

    #[test]
    fn test_classified_stream_error_is_recovered() {
        let tagged = io::Error::new(
            io::ErrorKind::ConnectionReset,
            NstoreError::BackendUnavailable("connection reset".into()),
        );
        let err = NstoreError::from(tagged);
        assert!(matches!(err, NstoreError::BackendUnavailable(_)));
        assert!(err.is_retryable());

        let plain = io::Error::new(io::ErrorKind::InvalidData, "bad utf-8");
        assert!(matches!(NstoreError::from(plain), NstoreError::Io(_)));
    }

    #[test]
    fn test_cache_sync_wrapping() {
        let wrapped = NstoreError::BackendUnavailable("reset".into()).into_cache_sync("s3://b/k");
        match wrapped {
            NstoreError::CacheSync { uri, message } => {
                assert_eq!(uri, "s3://b/k");
                assert!(message.contains("reset"));
            }
            other => panic!("Expected CacheSync, got {:?}", other),
        }

        let passthrough = NstoreError::NotFound("s3://b/k".into()).into_cache_sync("s3://b/k");
        assert!(matches!(passthrough, NstoreError::NotFound(_)));
    }
}
