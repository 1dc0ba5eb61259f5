//! # In-Memory Generation Cache
//!
//! Bounded store for finished generation results, shared by all sessions of
//! one feature namespace.
//!
//! ## Features
//!
//! - **TTL-Based Expiration**: entries are valid until exactly `created_at + ttl`
//! - **LRU Eviction**: capacity and total-size limits evict least recently used entries
//! - **Statistics**: hits, misses, evictions, expirations and entry ages
//! - **Background Sweep**: optional periodic removal of expired entries
//!
//! ## Example
//!
//! ```rust
//! use genstream_cache::cache::{CacheConfig, CacheStore};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = CacheConfig::builder()
//!     .default_ttl(Duration::from_secs(3600))
//!     .max_entries(100)
//!     .build();
//!
//! let cache = CacheStore::new(config);
//!
//! cache.set("analysis:5f1c0a9e2b7d4e11", "cached report".to_string()).await?;
//!
//! if let Some(value) = cache.get("analysis:5f1c0a9e2b7d4e11").await {
//!     println!("Cache hit: {}", value);
//! }
//!
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod entry;
pub mod invalidation;
pub mod store;
pub mod types;

pub use config::{CacheConfig, CacheConfigBuilder};
pub use entry::{estimate_size, CacheEntry, FALLBACK_ENTRY_SIZE};
pub use invalidation::{RemovalEvent, RemovalReason};
pub use store::CacheStore;
pub use types::CacheStats;
