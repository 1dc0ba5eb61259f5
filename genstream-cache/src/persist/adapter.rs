//! Long-lived cache records on top of a [`KeyValueBackend`]

use crate::clock::{system_clock, Clock, SharedClock};
use crate::hasher::{ContentHasher, UNCACHEABLE_KEY};
use crate::persist::backend::KeyValueBackend;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stored form of a persisted value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord<T> {
    pub value: T,

    /// Fingerprint of the key parts the value was generated from
    pub content_hash: String,

    /// Epoch milliseconds
    pub created_at: i64,

    /// Epoch milliseconds; the record is valid up to and including this instant
    pub expires_at: i64,
}

impl<T> PersistedRecord<T> {
    /// Lifetime left at `now_millis`; `None` once expired
    pub fn time_until_expiration(&self, now_millis: i64) -> Option<Duration> {
        let left = self.expires_at.checked_sub(now_millis)?;
        u64::try_from(left).ok().map(Duration::from_millis)
    }
}

/// One entry of the generation error log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub message: String,

    /// Epoch milliseconds, bumped past any existing entry for the same context
    pub timestamp: i64,

    pub context_hash: String,
}

/// Namespaced, content-validated persistence of generation results
///
/// Every failure is absorbed here: a broken or full store degrades to a
/// cache miss.
#[derive(Debug, Clone)]
pub struct PersistedKeyValueAdapter {
    backend: Arc<dyn KeyValueBackend>,
    clock: SharedClock,
    hasher: ContentHasher,
    default_ttl: Duration,
}

impl PersistedKeyValueAdapter {
    pub fn new(backend: Arc<dyn KeyValueBackend>, default_ttl: Duration) -> Self {
        Self::with_clock(backend, default_ttl, system_clock())
    }

    pub fn with_clock(
        backend: Arc<dyn KeyValueBackend>,
        default_ttl: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            backend,
            clock,
            hasher: ContentHasher::new(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Persist `value` with the default TTL; returns `false` on any failure
    pub fn save<P, T>(&self, namespace: &str, id: &str, extra_key_parts: &P, value: &T) -> bool
    where
        P: Serialize + ?Sized,
        T: Serialize + ?Sized,
    {
        self.save_with_ttl(namespace, id, extra_key_parts, value, self.default_ttl)
    }

    /// Persist `value` with an explicit TTL
    pub fn save_with_ttl<P, T>(
        &self,
        namespace: &str,
        id: &str,
        extra_key_parts: &P,
        value: &T,
        ttl: Duration,
    ) -> bool
    where
        P: Serialize + ?Sized,
        T: Serialize + ?Sized,
    {
        let Some(content_hash) = self.hasher.fingerprint(extra_key_parts) else {
            return false;
        };

        let created_at = self.now_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let record = PersistedRecord {
            value,
            content_hash: content_hash.clone(),
            created_at,
            expires_at: created_at.saturating_add(ttl_ms),
        };

        let text = match serde_json::to_string(&record) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize record for {}:{}: {}", namespace, id, e);
                return false;
            }
        };

        let key = record_key(namespace, id, &content_hash);
        match self.backend.put(&key, &text) {
            Ok(()) => {
                debug!("Saved persisted record {}", key);
                true
            }
            Err(e) => {
                warn!("Failed to persist {}: {}", key, e);
                false
            }
        }
    }

    /// Load a live value whose content hash matches `extra_key_parts`
    ///
    /// Expired, mismatched and unreadable records are deleted.
    pub fn load<P, T>(&self, namespace: &str, id: &str, extra_key_parts: &P) -> Option<T>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.load_record(namespace, id, extra_key_parts)
            .map(|record| record.value)
    }

    /// Like [`load`](Self::load), keeping the record metadata
    pub fn load_record<P, T>(&self, namespace: &str, id: &str, extra_key_parts: &P) -> Option<PersistedRecord<T>>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let content_hash = self.hasher.fingerprint(extra_key_parts)?;
        let key = record_key(namespace, id, &content_hash);

        let text = match self.backend.get(&key) {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read {}: {}", key, e);
                return None;
            }
        };

        let record: PersistedRecord<T> = match serde_json::from_str(&text) {
            Ok(record) => record,
            Err(e) => {
                warn!("Discarding corrupt record {}: {}", key, e);
                self.discard(&key);
                return None;
            }
        };

        if record.content_hash != content_hash {
            info!("Discarding record {} written for different content", key);
            self.discard(&key);
            return None;
        }

        if self.now_millis() > record.expires_at {
            debug!("Discarding expired record {}", key);
            self.discard(&key);
            return None;
        }

        Some(record)
    }

    /// Lifetime `record` has left by this adapter's clock
    pub fn remaining_ttl<T>(&self, record: &PersistedRecord<T>) -> Option<Duration> {
        record.time_until_expiration(self.now_millis())
    }

    /// Delete the record for `extra_key_parts`; `true` if one existed
    pub fn remove<P>(&self, namespace: &str, id: &str, extra_key_parts: &P) -> bool
    where
        P: Serialize + ?Sized,
    {
        let Some(content_hash) = self.hasher.fingerprint(extra_key_parts) else {
            return false;
        };
        let key = record_key(namespace, id, &content_hash);
        match self.backend.remove(&key) {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Failed to delete {}: {}", key, e);
                false
            }
        }
    }

    /// Delete every record of `(namespace, id)`; returns how many were removed
    pub fn clear_all(&self, namespace: &str, id: &str) -> usize {
        let prefix = format!("{}:{}:", namespace, id);

        let keys = match self.backend.keys_with_prefix(&prefix) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Failed to list {}: {}", prefix, e);
                return 0;
            }
        };

        let removed = keys
            .iter()
            .filter(|key| matches!(self.backend.remove(key), Ok(true)))
            .count();

        info!("Cleared {} persisted records under {}", removed, prefix);
        removed
    }

    /// Append a failure to the error log of `(namespace, id)`
    pub fn record_error<P>(&self, namespace: &str, id: &str, extra_key_parts: &P, message: &str) -> bool
    where
        P: Serialize + ?Sized,
    {
        let context_hash = self
            .hasher
            .fingerprint(extra_key_parts)
            .unwrap_or_else(|| UNCACHEABLE_KEY.to_string());

        let mut timestamp = self.now_millis();
        let key = loop {
            let key = format!("{}:{}", record_key(namespace, id, &context_hash), timestamp);
            match self.backend.get(&key) {
                Ok(None) => break key,
                Ok(Some(_)) => timestamp += 1,
                Err(e) => {
                    warn!("Failed to read error log {}: {}", key, e);
                    return false;
                }
            }
        };

        let record = ErrorRecord {
            message: message.to_string(),
            timestamp,
            context_hash,
        };

        let stored = serde_json::to_string(&record)
            .map_err(crate::error::CacheError::from)
            .and_then(|text| self.backend.put(&key, &text));

        match stored {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to record error under {}: {}", key, e);
                false
            }
        }
    }

    /// Error log of `(namespace, id)`, oldest first
    pub fn errors(&self, namespace: &str, id: &str) -> Vec<ErrorRecord> {
        let prefix = format!("{}:{}:", namespace, id);

        let keys = match self.backend.keys_with_prefix(&prefix) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Failed to list {}: {}", prefix, e);
                return Vec::new();
            }
        };

        let mut records: Vec<ErrorRecord> = keys
            .iter()
            .filter_map(|key| self.backend.get(key).ok().flatten())
            .filter_map(|text| serde_json::from_str(&text).ok())
            .collect();

        records.sort_by_key(|record| record.timestamp);
        records
    }

    fn discard(&self, key: &str) {
        if let Err(e) = self.backend.remove(key) {
            warn!("Failed to delete {}: {}", key, e);
        }
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

fn record_key(namespace: &str, id: &str, content_hash: &str) -> String {
    format!("{}:{}:{}", namespace, id, content_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persist::backend::MemoryBackend;
    use serde_json::json;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn adapter() -> (PersistedKeyValueAdapter, Arc<MemoryBackend>, ManualClock) {
        let backend = Arc::new(MemoryBackend::new());
        let clock = ManualClock::starting_now();
        let adapter = PersistedKeyValueAdapter::with_clock(backend.clone(), DAY, Arc::new(clock.clone()));
        (adapter, backend, clock)
    }

    #[test]
    fn test_save_and_load() {
        let (adapter, _, _) = adapter();
        let parts = json!({"market": "EU", "tier": 2});

        assert!(adapter.save("gtm", "acme", &parts, &"strategy text"));
        let loaded: Option<String> = adapter.load("gtm", "acme", &parts);
        assert_eq!(loaded.as_deref(), Some("strategy text"));

        let other: Option<String> = adapter.load("gtm", "acme", &json!({"market": "US"}));
        assert!(other.is_none());
    }

    #[test]
    fn test_record_layout() {
        let (adapter, backend, clock) = adapter();
        let parts = json!(["a"]);
        adapter.save("plan", "p1", &parts, &json!({"phases": []}));

        let hash = ContentHasher::new().fingerprint(&parts).unwrap();
        let text = backend.get(&format!("plan:p1:{}", hash)).unwrap().unwrap();
        let raw: serde_json::Value = serde_json::from_str(&text).unwrap();

        let created = clock.now().timestamp_millis();
        assert_eq!(raw["contentHash"], json!(hash));
        assert_eq!(raw["createdAt"], json!(created));
        assert_eq!(raw["expiresAt"], json!(created + 24 * 3600 * 1000));
        assert_eq!(raw["value"], json!({"phases": []}));
    }

    #[test]
    fn test_expiry_deletes_record() {
        let (adapter, backend, clock) = adapter();
        let parts = json!({"k": 1});
        adapter.save("gtm", "acme", &parts, &42u32);

        clock.advance(Duration::from_secs(23 * 3600));
        assert_eq!(adapter.load::<_, u32>("gtm", "acme", &parts), Some(42));

        clock.advance(Duration::from_secs(2 * 3600));
        assert_eq!(adapter.load::<_, u32>("gtm", "acme", &parts), None);
        assert!(backend.keys_with_prefix("gtm:").unwrap().is_empty());
    }

    #[test]
    fn test_record_reports_remaining_lifetime() {
        let (adapter, _, clock) = adapter();
        let parts = json!({"k": 1});
        adapter.save("gtm", "acme", &parts, &"v");

        clock.advance(Duration::from_secs(23 * 3600));
        let record = adapter.load_record::<_, String>("gtm", "acme", &parts).unwrap();
        assert_eq!(adapter.remaining_ttl(&record), Some(Duration::from_secs(3600)));
        assert_eq!(record.time_until_expiration(record.expires_at + 1), None);

        assert!(adapter.remove("gtm", "acme", &parts));
        assert!(!adapter.remove("gtm", "acme", &parts));
        assert_eq!(adapter.load::<_, String>("gtm", "acme", &parts), None);
    }

    #[test]
    fn test_content_hash_mismatch_deletes_record() {
        let (adapter, backend, _) = adapter();
        let parts = json!({"k": 1});
        let hash = ContentHasher::new().fingerprint(&parts).unwrap();
        let key = format!("gtm:acme:{}", hash);

        let record = json!({
            "value": "stale",
            "contentHash": "0000000000000000",
            "createdAt": 0,
            "expiresAt": i64::MAX,
        });
        backend.put(&key, &record.to_string()).unwrap();

        assert_eq!(adapter.load::<_, String>("gtm", "acme", &parts), None);
        assert_eq!(backend.get(&key).unwrap(), None);
    }

    #[test]
    fn test_corrupt_record_deleted() {
        let (adapter, backend, _) = adapter();
        let parts = json!({"k": 1});
        let hash = ContentHasher::new().fingerprint(&parts).unwrap();
        let key = format!("gtm:acme:{}", hash);

        backend.put(&key, "{not json").unwrap();

        assert_eq!(adapter.load::<_, String>("gtm", "acme", &parts), None);
        assert_eq!(backend.get(&key).unwrap(), None);
    }

    #[test]
    fn test_quota_failure_is_soft() {
        let backend = Arc::new(MemoryBackend::with_quota(32));
        let adapter = PersistedKeyValueAdapter::new(backend, DAY);

        assert!(!adapter.save("gtm", "acme", &json!({}), &"x".repeat(100)));
        assert_eq!(adapter.load::<_, String>("gtm", "acme", &json!({})), None);
    }

    #[test]
    fn test_clear_all_scoped_to_id() {
        let (adapter, _, _) = adapter();
        adapter.save("gtm", "acme", &json!(1), &"a");
        adapter.save("gtm", "acme", &json!(2), &"b");
        adapter.save("gtm", "other", &json!(1), &"c");

        assert_eq!(adapter.clear_all("gtm", "acme"), 2);
        assert_eq!(adapter.load::<_, String>("gtm", "other", &json!(1)).as_deref(), Some("c"));
    }

    #[test]
    fn test_error_log_never_overwrites() {
        let (adapter, _, clock) = adapter();
        let parts = json!({"k": 1});

        assert!(adapter.record_error("gtm.errors", "acme", &parts, "timeout"));
        assert!(adapter.record_error("gtm.errors", "acme", &parts, "rate limited"));
        clock.advance(Duration::from_secs(1));
        assert!(adapter.record_error("gtm.errors", "acme", &parts, "bad output"));

        let errors = adapter.errors("gtm.errors", "acme");
        let messages: Vec<_> = errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["timeout", "rate limited", "bad output"]);
        assert_eq!(errors[1].timestamp, errors[0].timestamp + 1);
    }
}
