//! Cache entry management with TTL support

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Size charged for a value that could not be serialized for measurement
pub const FALLBACK_ENTRY_SIZE: usize = 4 * 1024;

/// A cached value with its TTL and access metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// The cached value
    pub data: T,

    /// When the entry was written
    pub created_at: DateTime<Utc>,

    /// Lifetime measured from `created_at`
    pub ttl: Duration,

    /// Last hit (for LRU tracking)
    pub last_accessed_at: DateTime<Utc>,

    /// Number of hits served from this entry
    pub access_count: u64,

    /// Estimated footprint in bytes
    pub approx_size_bytes: usize,
}

impl<T: Serialize> CacheEntry<T> {
    /// Create an entry, measuring its size from the serialized value
    pub fn new(key: &str, data: T, ttl: Duration, now: DateTime<Utc>) -> Self {
        let approx_size_bytes = key.len() + estimate_size(&data);
        Self {
            data,
            created_at: now,
            ttl,
            last_accessed_at: now,
            access_count: 0,
            approx_size_bytes,
        }
    }
}

impl<T> CacheEntry<T> {
    /// Instant after which the entry is logically absent
    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Check if the entry has expired; an entry is still valid at exactly `created_at + ttl`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    /// Mark the entry as accessed (updates access time and count)
    pub fn mark_accessed(&mut self, now: DateTime<Utc>) {
        self.last_accessed_at = now;
        self.access_count += 1;
    }

    /// Get the age of the entry
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }
}

/// Approximate byte size of a value from its JSON encoding
pub fn estimate_size<T: Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_vec(value)
        .map(|bytes| bytes.len())
        .unwrap_or(FALLBACK_ENTRY_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::{Error as _, Serializer};

    struct Opaque;

    impl Serialize for Opaque {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("opaque"))
        }
    }

    #[test]
    fn test_cache_entry_creation() {
        let now = Utc::now();
        let entry = CacheEntry::new("test_key", "test_value".to_string(), Duration::from_secs(3600), now);

        assert_eq!(entry.data, "test_value");
        assert_eq!(entry.access_count, 0);
        assert!(!entry.is_expired(now));
        // "test_key" plus the quoted JSON string
        assert_eq!(entry.approx_size_bytes, 8 + 12);
    }

    #[test]
    fn test_entry_expiration_boundary() {
        let now = Utc::now();
        let entry = CacheEntry::new("k", 1u32, Duration::from_secs(10), now);

        assert!(!entry.is_expired(now + chrono::Duration::seconds(9)));
        assert!(!entry.is_expired(now + chrono::Duration::seconds(10)));
        assert!(entry.is_expired(now + chrono::Duration::milliseconds(10_001)));
    }

    #[test]
    fn test_mark_accessed() {
        let now = Utc::now();
        let mut entry = CacheEntry::new("k", "v", Duration::from_secs(3600), now);

        let later = now + chrono::Duration::seconds(5);
        entry.mark_accessed(later);

        assert_eq!(entry.access_count, 1);
        assert_eq!(entry.last_accessed_at, later);
        assert_eq!(entry.created_at, now);
    }

    #[test]
    fn test_age() {
        let now = Utc::now();
        let entry = CacheEntry::new("k", "v", Duration::from_secs(60), now);
        assert_eq!(entry.age(now + chrono::Duration::seconds(7)), Duration::from_secs(7));
    }

    #[test]
    fn test_unserializable_value_uses_fallback_size() {
        assert_eq!(estimate_size(&Opaque), FALLBACK_ENTRY_SIZE);
    }
}
