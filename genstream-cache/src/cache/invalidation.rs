//! Removal reasons and events
//!
//! Every entry leaves the store for one of four reasons. Sweeps and bulk
//! invalidations report what they removed as [`RemovalEvent`]s so callers
//! can log or forward them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why an entry left the cache
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemovalReason {
    /// TTL elapsed (lazy on lookup or eager on sweep)
    Expired,

    /// Evicted to stay under `max_entries`
    Capacity,

    /// Evicted to stay under `max_size_bytes`
    SizeLimit,

    /// Explicit `delete`, `clear` or prefix invalidation
    Manual,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemovalReason::Expired => write!(f, "TTL expired"),
            RemovalReason::Capacity => write!(f, "capacity limit reached"),
            RemovalReason::SizeLimit => write!(f, "size limit reached"),
            RemovalReason::Manual => write!(f, "manual invalidation"),
        }
    }
}

/// A batch of keys removed for the same reason
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemovalEvent {
    /// Reason for removal
    pub reason: RemovalReason,

    /// When the removal occurred
    pub timestamp: DateTime<Utc>,

    /// Keys that were removed
    pub keys: Vec<String>,

    /// Additional context
    pub context: Option<String>,
}

impl RemovalEvent {
    pub fn new(reason: RemovalReason, keys: Vec<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            reason,
            timestamp,
            keys,
            context: None,
        }
    }

    pub fn with_context(mut self, context: String) -> Self {
        self.context = Some(context);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removal_reason_display() {
        assert_eq!(RemovalReason::Expired.to_string(), "TTL expired");
        assert_eq!(RemovalReason::SizeLimit.to_string(), "size limit reached");
    }

    #[test]
    fn test_removal_event() {
        let event = RemovalEvent::new(
            RemovalReason::Manual,
            vec!["key1".to_string(), "key2".to_string()],
            Utc::now(),
        )
        .with_context("namespace cleared".to_string());

        assert_eq!(event.keys.len(), 2);
        assert_eq!(event.context, Some("namespace cleared".to_string()));
        assert!(matches!(event.reason, RemovalReason::Manual));
    }
}
