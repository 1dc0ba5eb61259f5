//! Main cache store implementation with LRU eviction and memory management

use crate::cache::{
    config::CacheConfig,
    entry::CacheEntry,
    invalidation::{RemovalEvent, RemovalReason},
    types::CacheStats,
};
use crate::clock::{system_clock, Clock, SharedClock};
use crate::error::{CacheError, Result};
use crate::hasher::ContentKey;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Bounded, generic in-memory cache with TTL and LRU eviction
///
/// One store is shared by every session of a feature namespace. All
/// operations take the same async mutex, so lookups, inserts and evictions
/// never interleave.
pub struct CacheStore<T> {
    /// Cache configuration
    pub(crate) config: CacheConfig,

    /// Internal storage
    state: Arc<Mutex<StoreState<T>>>,

    /// Time source for TTL checks
    clock: SharedClock,

    /// Background sweep task, if running
    sweeper: std::sync::Mutex<Option<SweeperHandle>>,
}

/// Internal cache storage
struct StoreState<T> {
    /// Main storage: key -> entry
    entries: HashMap<String, CacheEntry<T>>,

    /// LRU tracking: front is least recently used
    lru_queue: VecDeque<String>,

    /// Total approximate size of stored entries
    current_size_bytes: usize,

    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

struct SweeperHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl<T> StoreState<T> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            lru_queue: VecDeque::new(),
            current_size_bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry<T>> {
        let entry = self.entries.remove(key)?;
        self.lru_queue.retain(|k| k != key);
        self.current_size_bytes = self
            .current_size_bytes
            .saturating_sub(entry.approx_size_bytes);
        Some(entry)
    }

    fn touch(&mut self, key: &str) {
        self.lru_queue.retain(|k| k != key);
        self.lru_queue.push_back(key.to_string());
    }

    fn remove_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.remove_entry(key);
        }
        self.expirations += expired.len() as u64;
        expired
    }

    fn evict_lru(&mut self, reason: RemovalReason) -> bool {
        match self.lru_queue.pop_front() {
            Some(key) => {
                debug!("Evicting cache entry ({}): {}", reason, key);
                self.remove_entry(&key);
                self.evictions += 1;
                true
            }
            None => false,
        }
    }
}

impl<T> CacheStore<T>
where
    T: Clone + Serialize + Send + 'static,
{
    /// Create a new cache with the given configuration
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Create a cache reading time from `clock`
    pub fn with_clock(config: CacheConfig, clock: SharedClock) -> Self {
        info!("Initializing cache store with config: {:?}", config);

        Self {
            config,
            state: Arc::new(Mutex::new(StoreState::new())),
            clock,
            sweeper: std::sync::Mutex::new(None),
        }
    }

    /// Create a cache and start its background sweep
    ///
    /// Must be called from within a tokio runtime for the sweep to start.
    pub fn with_sweeper(config: CacheConfig) -> Self {
        let store = Self::new(config);
        store.start_sweeper();
        store
    }

    /// Configuration this store was built with
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Insert a value with the configured default TTL
    pub async fn set(&self, key: impl Into<String>, value: T) -> Result<()> {
        let ttl = self.config.ttl_with_jitter();
        self.set_with_ttl(key, value, ttl).await
    }

    /// Insert a value with an explicit TTL, replacing any previous entry
    pub async fn set_with_ttl(&self, key: impl Into<String>, value: T, ttl: Duration) -> Result<()> {
        let key = key.into();
        let now = self.clock.now();
        let entry = CacheEntry::new(&key, value, ttl, now);
        let size = entry.approx_size_bytes;

        if size > self.config.max_size_bytes {
            warn!("Refusing cache entry {} ({} bytes)", key, size);
            return Err(CacheError::EntryTooLarge {
                size,
                max: self.config.max_size_bytes,
            });
        }

        let mut state = self.state.lock().await;

        if state.remove_entry(&key).is_some() {
            debug!("Replacing existing cache entry: {}", key);
        }

        self.evict_if_needed(&mut state, size, now);

        state.entries.insert(key.clone(), entry);
        state.lru_queue.push_back(key.clone());
        state.current_size_bytes += size;

        debug!("Inserted cache entry: {} ({} bytes)", key, size);
        Ok(())
    }

    /// Get a value, promoting it to most recently used
    pub async fn get(&self, key: &str) -> Option<T> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let expired = match state.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                debug!("Cache miss: {}", key);
                state.misses += 1;
                return None;
            }
        };

        if expired {
            debug!("Cache entry expired: {}", key);
            state.remove_entry(key);
            state.misses += 1;
            state.expirations += 1;
            return None;
        }

        let value = state.entries.get_mut(key).map(|entry| {
            entry.mark_accessed(now);
            entry.data.clone()
        });
        state.hits += 1;
        state.touch(key);

        debug!("Cache hit: {}", key);
        value
    }

    /// Check for a live entry without touching LRU order or statistics
    pub async fn has(&self, key: &str) -> bool {
        let now = self.clock.now();
        let state = self.state.lock().await;
        state
            .entries
            .get(key)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false)
    }

    /// Look up a content key; uncacheable keys always miss
    pub async fn lookup(&self, key: &ContentKey) -> Option<T> {
        if !key.is_cacheable() {
            return None;
        }
        self.get(&key.as_cache_key()).await
    }

    /// Store under a content key; uncacheable keys are refused
    pub async fn store(&self, key: &ContentKey, value: T) -> Result<()> {
        if !key.is_cacheable() {
            return Err(CacheError::Uncacheable(key.to_string()));
        }
        self.set(key.as_cache_key(), value).await
    }

    /// Remove a specific entry
    pub async fn delete(&self, key: &str) -> Option<T> {
        let mut state = self.state.lock().await;
        let removed = state.remove_entry(key).map(|entry| entry.data);
        if removed.is_some() {
            debug!("Removed cache entry: {}", key);
        }
        removed
    }

    /// Clear all entries; statistics are kept
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;

        let count = state.entries.len();
        state.entries.clear();
        state.lru_queue.clear();
        state.current_size_bytes = 0;

        info!("Cleared {} entries from cache", count);
    }

    /// Remove every entry whose key starts with `prefix`
    pub async fn invalidate_prefix(&self, prefix: &str) -> RemovalEvent {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let keys: Vec<String> = state
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();

        for key in &keys {
            state.remove_entry(key);
        }

        info!("Invalidated {} entries with prefix: {}", keys.len(), prefix);
        RemovalEvent::new(RemovalReason::Manual, keys, now)
            .with_context(format!("prefix {}", prefix))
    }

    /// Remove all expired entries
    pub async fn cleanup_expired(&self) -> Vec<RemovalEvent> {
        let now = self.clock.now();
        let expired = self.state.lock().await.remove_expired(now);

        if expired.is_empty() {
            return Vec::new();
        }

        debug!("Cleaned up {} expired entries", expired.len());
        let count = expired.len();
        vec![RemovalEvent::new(RemovalReason::Expired, expired, now)
            .with_context(format!("Cleaned up {} expired entries", count))]
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let state = self.state.lock().await;

        let ages = state.entries.values().map(|entry| entry.age(now));
        let (oldest, newest) = ages.fold((None, None), |(oldest, newest): (Option<Duration>, Option<Duration>), age| {
            (
                Some(oldest.map_or(age, |o| o.max(age))),
                Some(newest.map_or(age, |n| n.min(age))),
            )
        });

        CacheStats {
            entries: state.entries.len(),
            total_size: state.current_size_bytes,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expirations: state.expirations,
            oldest_entry_age: oldest,
            newest_entry_age: newest,
        }
    }

    /// Get current cache size in bytes
    pub async fn size_bytes(&self) -> usize {
        self.state.lock().await.current_size_bytes
    }

    /// Get number of entries in cache
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Check if cache is empty
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    /// Start the periodic sweep of expired entries
    ///
    /// Returns `false` when the sweep is disabled, already running, or no
    /// tokio runtime is available.
    pub fn start_sweeper(&self) -> bool {
        if !self.config.enable_auto_cleanup {
            return false;
        }

        let mut slot = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return false;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No tokio runtime available, cache sweeper not started");
                return false;
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = runtime.spawn(sweep_loop(
            Arc::downgrade(&self.state),
            self.clock.clone(),
            self.config.cleanup_interval,
            shutdown_rx,
        ));

        *slot = Some(SweeperHandle { shutdown_tx, task });
        true
    }

    /// Whether the background sweep is running
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .map(|slot| slot.as_ref().map(|h| !h.task.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Internal: Evict entries if needed to make room for new entry
    fn evict_if_needed(&self, state: &mut StoreState<T>, needed_size: usize, now: DateTime<Utc>) {
        let over_limits = |state: &StoreState<T>| {
            state.entries.len() >= self.config.max_entries
                || state.current_size_bytes + needed_size > self.config.max_size_bytes
        };

        if over_limits(state) {
            let expired = state.remove_expired(now);
            if !expired.is_empty() {
                debug!("Dropped {} expired entries before eviction", expired.len());
            }
        }

        while state.entries.len() >= self.config.max_entries {
            if !state.evict_lru(RemovalReason::Capacity) {
                break;
            }
        }

        while state.current_size_bytes + needed_size > self.config.max_size_bytes {
            if !state.evict_lru(RemovalReason::SizeLimit) {
                break;
            }
        }
    }
}

impl<T> CacheStore<T> {
    /// Stop the background sweep
    pub fn shutdown(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(handle) = handle {
            let _ = handle.shutdown_tx.send(true);
            debug!("Cache sweeper shutdown requested");
        }
    }
}

impl<T> Drop for CacheStore<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Background task for automatic cache cleanup
async fn sweep_loop<T>(
    state: Weak<Mutex<StoreState<T>>>,
    clock: SharedClock,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("Starting cache sweeper (interval: {:?})", interval);

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(state) = state.upgrade() else {
                    break;
                };
                let expired = state.lock().await.remove_expired(clock.now());
                if !expired.is_empty() {
                    debug!("Sweep removed {} expired entries", expired.len());
                }
            }
        }
    }

    info!("Cache sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hasher::ContentHasher;

    fn store_with_clock(config: CacheConfig) -> (CacheStore<String>, ManualClock) {
        let clock = ManualClock::starting_now();
        (CacheStore::with_clock(config, Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_basic_set_and_get() {
        let cache = CacheStore::new(CacheConfig::default());

        cache.set("key1", "value1".to_string()).await.unwrap();

        assert_eq!(cache.get("key1").await, Some("value1".to_string()));

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_cache_miss() {
        let cache: CacheStore<String> = CacheStore::new(CacheConfig::default());

        assert_eq!(cache.get("nonexistent").await, None);
        assert_eq!(cache.stats().await.misses, 1);
    }

    #[tokio::test]
    async fn test_ttl_boundary() {
        let (cache, clock) = store_with_clock(CacheConfig::default());

        cache
            .set_with_ttl("key1", "value1".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        clock.advance(Duration::from_millis(59_999));
        assert!(cache.has("key1").await);
        assert!(cache.get("key1").await.is_some());

        clock.advance(Duration::from_millis(2));
        assert!(!cache.has("key1").await);
        assert!(cache.get("key1").await.is_none());

        let stats = cache.stats().await;
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_order() {
        let config = CacheConfig::builder().max_entries(3).build();
        let cache = CacheStore::new(config);

        cache.set("key1", "value1".to_string()).await.unwrap();
        cache.set("key2", "value2".to_string()).await.unwrap();
        cache.set("key3", "value3".to_string()).await.unwrap();
        cache.set("key4", "value4".to_string()).await.unwrap();

        assert!(!cache.has("key1").await);
        assert!(cache.has("key2").await);
        assert!(cache.has("key3").await);
        assert!(cache.has("key4").await);
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_access_promotes_entry() {
        let config = CacheConfig::builder().max_entries(3).build();
        let cache = CacheStore::new(config);

        cache.set("key1", "value1".to_string()).await.unwrap();
        cache.set("key2", "value2".to_string()).await.unwrap();
        cache.set("key3", "value3".to_string()).await.unwrap();

        // key1 becomes most recently used; key2 is now the LRU entry
        cache.get("key1").await;
        cache.set("key4", "value4".to_string()).await.unwrap();

        assert!(cache.has("key1").await);
        assert!(!cache.has("key2").await);
    }

    #[tokio::test]
    async fn test_has_does_not_promote_or_count() {
        let config = CacheConfig::builder().max_entries(2).build();
        let cache = CacheStore::new(config);

        cache.set("key1", "value1".to_string()).await.unwrap();
        cache.set("key2", "value2".to_string()).await.unwrap();

        assert!(cache.has("key1").await);
        cache.set("key3", "value3".to_string()).await.unwrap();

        assert!(!cache.has("key1").await);
        let stats = cache.stats().await;
        assert_eq!(stats.hits + stats.misses, 0);
    }

    #[tokio::test]
    async fn test_size_based_eviction() {
        // each entry: 2-byte key + 102-byte JSON string
        let config = CacheConfig::builder().max_size_bytes(250).build();
        let cache = CacheStore::new(config);

        cache.set("k1", "v".repeat(100)).await.unwrap();
        cache.set("k2", "v".repeat(100)).await.unwrap();
        cache.set("k3", "v".repeat(100)).await.unwrap();

        assert!(!cache.has("k1").await);
        assert!(cache.size_bytes().await <= 250);
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected() {
        let config = CacheConfig::builder().max_size_bytes(64).build();
        let cache = CacheStore::new(config);

        cache.set("small", "ok".to_string()).await.unwrap();
        let result = cache.set("big", "x".repeat(500)).await;

        assert!(matches!(result, Err(CacheError::EntryTooLarge { .. })));
        assert!(cache.has("small").await);
        assert_eq!(cache.stats().await.evictions, 0);
    }

    #[tokio::test]
    async fn test_replace_keeps_size_accounting() {
        let cache = CacheStore::new(CacheConfig::default());

        cache.set("key", "a".repeat(10)).await.unwrap();
        let first = cache.size_bytes().await;
        cache.set("key", "a".repeat(10)).await.unwrap();

        assert_eq!(cache.size_bytes().await, first);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_hit_and_miss_rates() {
        let cache = CacheStore::new(CacheConfig::default());
        cache.set("present", "v".to_string()).await.unwrap();

        for _ in 0..3 {
            cache.get("present").await;
        }
        cache.get("absent").await;

        let stats = cache.stats().await;
        assert_eq!(stats.hit_rate(), 0.75);
        assert_eq!(stats.miss_rate(), 0.25);
    }

    #[tokio::test]
    async fn test_entry_ages() {
        let (cache, clock) = store_with_clock(CacheConfig::default());

        cache.set("old", "v".to_string()).await.unwrap();
        clock.advance(Duration::from_secs(30));
        cache.set("new", "v".to_string()).await.unwrap();
        clock.advance(Duration::from_secs(10));

        let stats = cache.stats().await;
        assert_eq!(stats.oldest_entry_age, Some(Duration::from_secs(40)));
        assert_eq!(stats.newest_entry_age, Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let cache = CacheStore::new(CacheConfig::default());

        cache.set("key1", "value1".to_string()).await.unwrap();
        cache.set("key2", "value2".to_string()).await.unwrap();

        assert_eq!(cache.delete("key1").await, Some("value1".to_string()));
        assert_eq!(cache.delete("key1").await, None);

        cache.clear().await;
        assert!(cache.is_empty().await);
        assert_eq!(cache.size_bytes().await, 0);
    }

    #[tokio::test]
    async fn test_invalidate_prefix() {
        let cache = CacheStore::new(CacheConfig::default());

        cache.set("plan:a", "1".to_string()).await.unwrap();
        cache.set("plan:b", "2".to_string()).await.unwrap();
        cache.set("strategy:a", "3".to_string()).await.unwrap();

        let event = cache.invalidate_prefix("plan:").await;
        assert_eq!(event.keys.len(), 2);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let (cache, clock) = store_with_clock(CacheConfig::default());

        cache
            .set_with_ttl("short", "v".to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        cache
            .set_with_ttl("long", "v".to_string(), Duration::from_secs(500))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(6));
        let events = cache.cleanup_expired().await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].keys, vec!["short".to_string()]);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_content_key_helpers() {
        let cache = CacheStore::new(CacheConfig::default());
        let hasher = ContentHasher::new();

        let key = hasher.hash("analysis", &serde_json::json!({"a": 1}), &serde_json::json!({}));
        cache.store(&key, "report".to_string()).await.unwrap();
        assert_eq!(cache.lookup(&key).await, Some("report".to_string()));

        let sentinel = ContentKey::uncacheable("analysis");
        assert!(cache.store(&sentinel, "x".to_string()).await.is_err());
        assert_eq!(cache.lookup(&sentinel).await, None);
    }

    #[tokio::test]
    async fn test_background_sweep_and_shutdown() {
        let config = CacheConfig::builder()
            .cleanup_interval(Duration::from_millis(20))
            .build();
        let (cache, clock) = store_with_clock(config);

        assert!(cache.start_sweeper());
        assert!(!cache.start_sweeper());

        cache
            .set_with_ttl("key", "v".to_string(), Duration::from_secs(1))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.len().await, 0);
        assert_eq!(cache.stats().await.expirations, 1);

        cache.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!cache.is_sweeping());
    }

    #[test]
    fn test_sweeper_requires_runtime() {
        let cache: CacheStore<String> = CacheStore::new(CacheConfig::default());
        assert!(!cache.start_sweeper());
    }
}
