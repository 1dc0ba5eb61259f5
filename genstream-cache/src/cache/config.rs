//! Configuration for the cache system

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`CacheStore`](super::CacheStore)
///
/// Defaults follow the in-memory analysis cache: entries live for one hour,
/// and the sweep runs every five minutes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Default time-to-live for cache entries
    pub default_ttl: Duration,

    /// Maximum number of entries in the cache
    pub max_entries: usize,

    /// Maximum total approximate size of cached data in bytes
    pub max_size_bytes: usize,

    /// TTL jitter factor (0.0 - 1.0)
    /// Spreads expiry of entries written together; 0.0 disables it
    pub ttl_jitter: f64,

    /// Enable the background sweep of expired entries
    pub enable_auto_cleanup: bool,

    /// Interval between background sweeps
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            max_entries: 100,
            // 50 MB
            max_size_bytes: 50 * 1024 * 1024,
            ttl_jitter: 0.0,
            enable_auto_cleanup: true,
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_entries == 0 {
            return Err("max_entries must be greater than 0".to_string());
        }

        if self.max_size_bytes == 0 {
            return Err("max_size_bytes must be greater than 0".to_string());
        }

        if self.default_ttl.is_zero() {
            return Err("default_ttl must be greater than 0".to_string());
        }

        if self.ttl_jitter < 0.0 || self.ttl_jitter > 1.0 {
            return Err("ttl_jitter must be between 0.0 and 1.0".to_string());
        }

        if self.enable_auto_cleanup && self.cleanup_interval.is_zero() {
            return Err("cleanup_interval must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Calculate actual TTL with jitter applied
    pub fn ttl_with_jitter(&self) -> Duration {
        if self.ttl_jitter == 0.0 {
            return self.default_ttl;
        }

        let base_secs = self.default_ttl.as_secs_f64();
        let jitter_range = base_secs * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(1.0);

        Duration::from_secs_f64(final_secs)
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    default_ttl: Option<Duration>,
    max_entries: Option<usize>,
    max_size_bytes: Option<usize>,
    ttl_jitter: Option<f64>,
    enable_auto_cleanup: Option<bool>,
    cleanup_interval: Option<Duration>,
}

impl CacheConfigBuilder {
    /// Set default TTL for cache entries
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Set maximum number of cache entries
    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    /// Set maximum cache size in bytes
    pub fn max_size_bytes(mut self, size: usize) -> Self {
        self.max_size_bytes = Some(size);
        self
    }

    /// Set TTL jitter factor (0.0 - 1.0)
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    /// Enable or disable the background sweep
    pub fn enable_auto_cleanup(mut self, enable: bool) -> Self {
        self.enable_auto_cleanup = Some(enable);
        self
    }

    /// Set the sweep interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            default_ttl: self.default_ttl.unwrap_or(defaults.default_ttl),
            max_entries: self.max_entries.unwrap_or(defaults.max_entries),
            max_size_bytes: self.max_size_bytes.unwrap_or(defaults.max_size_bytes),
            ttl_jitter: self.ttl_jitter.unwrap_or(defaults.ttl_jitter),
            enable_auto_cleanup: self
                .enable_auto_cleanup
                .unwrap_or(defaults.enable_auto_cleanup),
            cleanup_interval: self.cleanup_interval.unwrap_or(defaults.cleanup_interval),
        }
    }
}

/// Preset configurations for the generation features
impl CacheConfig {
    /// Profile and business analysis: 1 hour
    pub fn analysis() -> Self {
        Self::default()
    }

    /// Go-to-market strategy: 24 hours
    pub fn strategy() -> Self {
        Self {
            default_ttl: Duration::from_secs(24 * 3600),
            max_entries: 50,
            cleanup_interval: Duration::from_secs(900),
            ..Default::default()
        }
    }

    /// Implementation plan: 24 hours
    pub fn plan() -> Self {
        Self {
            default_ttl: Duration::from_secs(24 * 3600),
            max_entries: 50,
            cleanup_interval: Duration::from_secs(900),
            ..Default::default()
        }
    }

    /// Configuration for memory-constrained environments
    pub fn small() -> Self {
        Self {
            default_ttl: Duration::from_secs(1800),
            max_entries: 16,
            max_size_bytes: 4 * 1024 * 1024,
            ..Default::default()
        }
    }
}
