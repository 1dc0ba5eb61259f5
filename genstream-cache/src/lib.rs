//! # genstream-cache
//!
//! Content-addressed caching for streamed LLM generations.
//!
//! ## Features
//!
//! - Deterministic request fingerprints (XXH3 over canonical JSON)
//! - Bounded in-memory store with TTL, LRU eviction and statistics
//! - Durable, namespaced records validated against the content they were
//!   generated from
//! - Pluggable clock so expiry is testable without sleeping
//!
//! ## Short-lived cache
//!
//! ```rust
//! use genstream_cache::{CacheConfig, CacheStore, ContentHasher};
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let hasher = ContentHasher::new();
//! let cache: CacheStore<String> = CacheStore::new(CacheConfig::analysis());
//!
//! let key = hasher.hash("analysis", &json!({"model": "fast"}), &json!({"company": "Acme"}));
//! if cache.lookup(&key).await.is_none() {
//!     cache.store(&key, "## Overview\n...".to_string()).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Long-lived cache
//!
//! ```rust
//! use genstream_cache::{MemoryBackend, PersistedKeyValueAdapter};
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let adapter = PersistedKeyValueAdapter::new(
//!     Arc::new(MemoryBackend::new()),
//!     Duration::from_secs(24 * 3600),
//! );
//!
//! let parts = json!({"market": "EU"});
//! adapter.save("gtm", "acme", &parts, &"strategy");
//! let cached: Option<String> = adapter.load("gtm", "acme", &parts);
//! assert_eq!(cached.as_deref(), Some("strategy"));
//! ```

pub mod cache;
pub mod clock;
pub mod error;
pub mod hasher;
pub mod persist;

pub use cache::{CacheConfig, CacheStats, CacheStore};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{CacheError, Result};
pub use hasher::{canonical_json, ContentHasher, ContentKey, UNCACHEABLE_KEY};
pub use persist::{
    ErrorRecord, FileBackend, KeyValueBackend, MemoryBackend, PersistedKeyValueAdapter,
    PersistedRecord,
};
