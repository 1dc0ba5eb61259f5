//! Durable key-value backends
//!
//! A backend stores opaque JSON text under string keys. The adapter on top
//! owns record layout and expiry; backends only move bytes.

use crate::error::{CacheError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Raw storage for persisted cache records
pub trait KeyValueBackend: Send + Sync + fmt::Debug {
    /// Read the text stored under `key`
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value
    fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`; returns whether it existed
    fn remove(&self, key: &str) -> Result<bool>;

    /// All stored keys starting with `prefix`, in ascending order
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-process backend with an optional byte quota
///
/// The quota counts key and value lengths, mirroring browser-style storage
/// limits.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that refuses writes once `quota_bytes` would be exceeded
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    /// Bytes currently charged against the quota
    pub fn used_bytes(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

impl KeyValueBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(quota) = self.quota_bytes {
            let replaced = entries.get(key).map(|old| key.len() + old.len()).unwrap_or(0);
            let used: usize = entries.iter().map(|(k, v)| k.len() + v.len()).sum::<usize>() - replaced;
            let requested = key.len() + value.len();

            if used + requested > quota {
                return Err(CacheError::QuotaExceeded {
                    quota,
                    used,
                    requested,
                });
            }
        }

        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.remove(key).is_some())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

/// One JSON file per key inside a directory
///
/// Keys are percent-encoded into file names, so any key is representable.
/// Writes go to a temporary file that is renamed into place.
#[derive(Debug, Clone)]
pub struct FileBackend {
    base_dir: PathBuf,
}

const RECORD_EXTENSION: &str = ".json";
const TEMP_SUFFIX: &str = ".tmp";

impl FileBackend {
    /// Open (creating if needed) a backend rooted at `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}{}", encode_key(key), RECORD_EXTENSION))
    }
}

impl KeyValueBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let temp = self.base_dir.join(format!(
            "{}{}{}",
            encode_key(key),
            RECORD_EXTENSION,
            TEMP_SUFFIX
        ));

        fs::write(&temp, value)?;
        if let Err(e) = fs::rename(&temp, &path) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }

        debug!("Persisted {} ({} bytes)", key, value.len());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();

        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(stem) = name.strip_suffix(RECORD_EXTENSION) else {
                continue;
            };
            if let Some(key) = decode_key(stem) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// Percent-encode everything outside the URL-unreserved set
fn encode_key(key: &str) -> String {
    urlencoding::encode(key).into_owned()
}

fn decode_key(encoded: &str) -> Option<String> {
    urlencoding::decode(encoded).ok().map(|key| key.into_owned())
}
