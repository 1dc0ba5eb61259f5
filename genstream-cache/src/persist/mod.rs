//! Durable storage for long-lived generation caches
//!
//! [`PersistedKeyValueAdapter`] keys records as `"<namespace>:<id>:<hash>"`
//! where the hash fingerprints the inputs the value was generated from.
//! Storage sits behind [`KeyValueBackend`].

pub mod adapter;
pub mod backend;

pub use adapter::{ErrorRecord, PersistedKeyValueAdapter, PersistedRecord};
pub use backend::{FileBackend, KeyValueBackend, MemoryBackend};
