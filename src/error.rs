//! Error types for the hybrid cache

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can be observed by cache callers.
///
/// Every variant is cheap to clone: a single outcome of a shared value
/// factory is handed to all callers waiting on the same key.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// The value factory returned an error. The same error object is
    /// delivered to every caller of the generation.
    #[error("value factory failed: {0}")]
    Factory(Arc<anyhow::Error>),

    /// The value factory panicked
    #[error("value factory panicked for key {key}")]
    FactoryPanicked { key: String },

    /// The caller's own cancellation token fired before a value was ready
    #[error("operation cancelled by caller")]
    Cancelled { token: CancellationToken },

    /// Every caller detached, so the shared operation was stopped
    #[error("shared operation for key {key} was cancelled by all callers")]
    GroupCancelled { key: String },

    /// No value in any tier and the underlying data source is disabled
    #[error("no cached value for key {key}")]
    Miss { key: String },

    /// Serialization or deserialization failed
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Distributed store failure
    #[error("distributed cache error: {0}")]
    Distributed(String),

    /// Key rejected by validation
    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    /// Serialized payload exceeds the configured maximum
    #[error("payload of {size} bytes exceeds maximum of {maximum} bytes")]
    PayloadTooLarge { size: usize, maximum: usize },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Wrap a factory failure so it can be fanned out to many waiters
    pub fn factory(err: anyhow::Error) -> Self {
        CacheError::Factory(Arc::new(err))
    }

    /// Borrow the original factory error, if this is one
    pub fn factory_error(&self) -> Option<&anyhow::Error> {
        match self {
            CacheError::Factory(err) => Some(err.as_ref()),
            _ => None,
        }
    }

    /// True for either form of cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            CacheError::Cancelled { .. } | CacheError::GroupCancelled { .. }
        )
    }

    /// The cancellation token this error is attributed to, if any
    pub fn cancelled_token(&self) -> Option<&CancellationToken> {
        match self {
            CacheError::Cancelled { token } => Some(token),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_error_is_shared_between_clones() {
        let err = CacheError::factory(anyhow::anyhow!("boom"));
        let cloned = err.clone();

        match (&err, &cloned) {
            (CacheError::Factory(a), CacheError::Factory(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected factory errors"),
        }
        assert_eq!(cloned.factory_error().unwrap().to_string(), "boom");
    }

    #[test]
    fn test_cancelled_carries_callers_token() {
        let token = CancellationToken::new();
        token.cancel();
        let err = CacheError::Cancelled {
            token: token.clone(),
        };

        assert!(err.is_cancelled());
        assert!(err.cancelled_token().unwrap().is_cancelled());
        assert!(CacheError::GroupCancelled { key: "k".into() }
            .cancelled_token()
            .is_none());
    }

    #[test]
    fn test_display() {
        let err = CacheError::PayloadTooLarge {
            size: 10,
            maximum: 5,
        };
        assert_eq!(
            err.to_string(),
            "payload of 10 bytes exceeds maximum of 5 bytes"
        );
    }
}
