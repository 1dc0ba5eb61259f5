//! Content-addressed cache keys
//!
//! A generation is identified by what was asked, not by who asked for it:
//! the feature namespace, the request configuration and the context it runs
//! against. All three are serialized to JSON, object keys are sorted
//! recursively, and the canonical text is hashed with XXH3-64. Two requests
//! that differ only in field insertion order therefore share a key.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use tracing::warn;
use xxhash_rust::xxh3::xxh3_64;

/// Key returned when the inputs could not be canonicalized
pub const UNCACHEABLE_KEY: &str = "uncacheable";

/// A content-addressed cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentKey {
    namespace: String,
    digest: String,
    cacheable: bool,
}

impl ContentKey {
    /// Key for inputs that failed to serialize; never stored, never hit
    pub fn uncacheable(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            digest: UNCACHEABLE_KEY.to_string(),
            cacheable: false,
        }
    }

    /// Feature namespace this key belongs to
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Hex digest of the canonical content
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Whether the key may be used for lookups and inserts
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Full cache key, `<namespace>:<digest>`
    pub fn as_cache_key(&self) -> String {
        format!("{}:{}", self.namespace, self.digest)
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.digest)
    }
}

/// Deterministic fingerprinting of request content
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHasher;

impl ContentHasher {
    pub fn new() -> Self {
        Self
    }

    /// Hash `(namespace, config, context)` into a content key
    pub fn hash<C, X>(&self, namespace: &str, config: &C, context: &X) -> ContentKey
    where
        C: Serialize + ?Sized,
        X: Serialize + ?Sized,
    {
        let parts = serde_json::to_value(config).and_then(|config| {
            serde_json::to_value(context).map(|context| (config, context))
        });

        match parts {
            Ok((config, context)) => {
                let tuple = Value::Array(vec![Value::String(namespace.to_string()), config, context]);
                ContentKey {
                    namespace: namespace.to_string(),
                    digest: digest_value(&tuple),
                    cacheable: true,
                }
            }
            Err(e) => {
                warn!("Request for {} is not cacheable: {}", namespace, e);
                ContentKey::uncacheable(namespace)
            }
        }
    }

    /// Hash a single value; `None` if it cannot be serialized
    pub fn fingerprint<T: Serialize + ?Sized>(&self, value: &T) -> Option<String> {
        match serde_json::to_value(value) {
            Ok(value) => Some(digest_value(&value)),
            Err(e) => {
                warn!("Value is not fingerprintable: {}", e);
                None
            }
        }
    }
}

/// Canonical JSON text: object keys sorted at every depth
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            // Map iteration order follows serde_json's `preserve_order` feature.
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn digest_value(value: &Value) -> String {
    format!("{:016x}", xxh3_64(canonical_json(value).as_bytes()))
}
