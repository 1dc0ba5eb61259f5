//! Statistics reported by the cache store

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Point-in-time view of cache performance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CacheStats {
    /// Number of entries currently stored (including not-yet-swept expired ones)
    pub entries: usize,

    /// Sum of the approximate entry sizes in bytes
    pub total_size: usize,

    /// Total number of cache hits
    pub hits: u64,

    /// Total number of cache misses
    pub misses: u64,

    /// Entries removed to respect the capacity or size limit
    pub evictions: u64,

    /// Entries removed because their TTL elapsed
    pub expirations: u64,

    /// Age of the oldest stored entry
    pub oldest_entry_age: Option<Duration>,

    /// Age of the most recently written entry
    pub newest_entry_age: Option<Duration>,
}

impl CacheStats {
    /// Fraction of lookups that were hits, `0.0` before any lookup
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Fraction of lookups that were misses, `0.0` before any lookup
    pub fn miss_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.misses as f64 / total as f64
        }
    }

    /// Average entry size in bytes
    pub fn avg_entry_size(&self) -> usize {
        if self.entries == 0 {
            0
        } else {
            self.total_size / self.entries
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, entries: {}, size: {} bytes, evictions: {}, expirations: {} }}",
            self.hits,
            self.misses,
            self.hit_rate() * 100.0,
            self.entries,
            self.total_size,
            self.evictions,
            self.expirations
        )
    }
}
