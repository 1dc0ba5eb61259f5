//! Error types for cache and persistence operations
//!
//! Most callers never see these: the persisted adapter absorbs storage
//! failures and degrades to a cache miss. They surface from the in-memory
//! [`CacheStore`](crate::cache::CacheStore) and from the raw
//! [`KeyValueBackend`](crate::persist::KeyValueBackend) implementations.

use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// A single entry is larger than the whole cache budget
    #[error("Entry of {size} bytes exceeds the cache size limit of {max} bytes")]
    EntryTooLarge { size: usize, max: usize },

    /// The key was produced from a value that could not be canonicalized
    #[error("Key is not cacheable: {0}")]
    Uncacheable(String),

    /// Stored data is unreadable or does not match the expected schema
    #[error("Corrupt cache record at {key}: {reason}")]
    Corruption { key: String, reason: String },

    /// The storage backend refused a write because its quota is exhausted
    #[error("Storage quota exceeded: {used} of {quota} bytes in use, {requested} requested")]
    QuotaExceeded {
        quota: usize,
        used: usize,
        requested: usize,
    },

    /// Filesystem error from a file-backed store
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CacheError::EntryTooLarge { size: 2048, max: 1024 };
        assert_eq!(
            error.to_string(),
            "Entry of 2048 bytes exceeds the cache size limit of 1024 bytes"
        );

        let quota = CacheError::QuotaExceeded {
            quota: 100,
            used: 90,
            requested: 20,
        };
        assert!(quota.to_string().contains("90 of 100 bytes"));

        let corrupt = CacheError::Corruption {
            key: "plan:user-1:abc".to_string(),
            reason: "expected value".to_string(),
        };
        assert!(corrupt.to_string().contains("plan:user-1:abc"));
    }

    #[test]
    fn test_error_conversion() {
        let error: CacheError = "test error".into();
        assert!(matches!(error, CacheError::Other(_)));

        let error: CacheError = "test error".to_string().into();
        assert!(matches!(error, CacheError::Other(_)));

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error: CacheError = json_err.into();
        assert!(matches!(error, CacheError::SerializationError(_)));
    }
}
