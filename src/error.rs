//! Error types for the entity cache
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for cache configuration and entity operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The same entity name was requested again with different options
    #[error("The options for entity cache {0} were changed")]
    OptionsChanged(String),

    /// The same entity name was requested again for a different value type
    #[error("Entity cache {0} was registered for a different value type")]
    TypeMismatch(String),

    /// In-place update requested for a scalar value
    #[error("Operation \"update\" for {0} value is not supported")]
    UnsupportedUpdate(String),

    /// Value could not be converted to or from JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compacted payload is not something `serialize` produces
    #[error("Malformed compacted payload: {0}")]
    Malformed(String),
}

// == Storage Error Enum ==
/// Failures reported by a storage medium.
///
/// These never surface from the cache store itself: a failed write turns
/// into a `false` return and an availability recheck.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Medium ran out of space
    #[error("Quota exceeded: needed {needed} bytes, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    /// Underlying file system failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Medium cannot be used at all
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

// == Result Type Alias ==
/// Convenience Result type for the entity cache.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_changed_message() {
        let err = CacheError::OptionsChanged("User".to_string());
        assert_eq!(err.to_string(), "The options for entity cache User were changed");
    }

    #[test]
    fn test_quota_message() {
        let err = StorageError::QuotaExceeded {
            needed: 10,
            available: 4,
        };
        assert!(err.to_string().contains("needed 10 bytes"));
    }

    #[test]
    fn test_serde_error_converts() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: CacheError = parse.unwrap_err().into();
        assert!(matches!(err, CacheError::Serialization(_)));
    }
}
