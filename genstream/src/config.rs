//! Application and controller configuration

use anyhow::{Context, Result};
use clap::ValueEnum;
use genstream_cache::CacheConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::artifact::ArtifactKind;
use crate::processor::ProcessorConfig;

/// Environment variable overriding [`GenstreamConfig::store_dir`]
pub const STORE_DIR_ENV: &str = "GENSTREAM_STORE_DIR";

/// The generation features sharing the caching pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    /// Profile and business analysis
    Analysis,
    /// Go-to-market strategy
    Strategy,
    /// Implementation plan
    Plan,
}

impl Feature {
    pub fn namespace(self) -> &'static str {
        match self {
            Feature::Analysis => "analysis",
            Feature::Strategy => "strategy",
            Feature::Plan => "plan",
        }
    }

    pub fn cache_config(self) -> CacheConfig {
        match self {
            Feature::Analysis => CacheConfig::analysis(),
            Feature::Strategy => CacheConfig::strategy(),
            Feature::Plan => CacheConfig::plan(),
        }
    }

    pub fn artifact_kind(self) -> ArtifactKind {
        match self {
            Feature::Analysis | Feature::Strategy => ArtifactKind::Report,
            Feature::Plan => ArtifactKind::Plan,
        }
    }

    /// Namespace of the persisted error log
    pub fn error_namespace(self) -> String {
        format!("{}.errors", self.namespace())
    }
}

/// Settings for one [`StreamIngestionController`](crate::controller::StreamIngestionController)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Cache namespace; also the persisted record namespace
    pub namespace: String,

    /// Owner of persisted records (user, company or project id)
    pub owner_id: String,

    pub artifact: ArtifactKind,

    /// Minimum spacing of structural updates
    pub throttle_interval: Duration,

    /// Characters per replayed chunk
    pub replay_chunk_size: usize,

    /// Pause between replayed chunks
    pub replay_delay: Duration,

    pub processor: ProcessorConfig,

    /// Finished sessions kept for `snapshot`
    pub history_limit: usize,
}

impl ControllerConfig {
    pub fn new(namespace: impl Into<String>, owner_id: impl Into<String>, artifact: ArtifactKind) -> Self {
        Self {
            namespace: namespace.into(),
            owner_id: owner_id.into(),
            artifact,
            throttle_interval: Duration::from_millis(100),
            replay_chunk_size: 48,
            replay_delay: Duration::from_millis(15),
            processor: ProcessorConfig::default(),
            history_limit: 8,
        }
    }

    pub fn for_feature(feature: Feature, owner_id: impl Into<String>) -> Self {
        let mut config = Self::new(feature.namespace(), owner_id, feature.artifact_kind());
        if feature == Feature::Plan {
            config.processor = ProcessorConfig {
                expected_sections: 8,
                expected_length: 8_000,
            };
        }
        config
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.namespace.is_empty() || self.namespace.contains(':') {
            return Err("namespace must be non-empty and must not contain ':'".to_string());
        }
        if self.owner_id.contains(':') {
            return Err("owner_id must not contain ':'".to_string());
        }
        if self.replay_chunk_size == 0 {
            return Err("replay_chunk_size must be greater than 0".to_string());
        }
        if self.processor.expected_sections == 0 || self.processor.expected_length == 0 {
            return Err("processor expectations must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// External generator command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            program: "genstream-generator".to_string(),
            args: Vec::new(),
        }
    }
}

/// Top-level settings, read from YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenstreamConfig {
    /// Directory of the file-backed persisted cache
    pub store_dir: PathBuf,

    pub owner_id: String,

    pub generator: GeneratorConfig,

    pub throttle_interval_ms: u64,

    pub replay_chunk_size: usize,

    pub replay_delay_ms: u64,
}

impl Default for GenstreamConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            owner_id: "default".to_string(),
            generator: GeneratorConfig::default(),
            throttle_interval_ms: 100,
            replay_chunk_size: 48,
            replay_delay_ms: 15,
        }
    }
}

impl GenstreamConfig {
    /// Load settings from `path` (or the default location), then apply
    /// `.env` and environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let path = path.map(Path::to_path_buf).or_else(default_config_path);
        let config = match path {
            Some(ref path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };

        Ok(config.with_env(|key| std::env::var(key).ok()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        serde_yaml::from_str(&content).with_context(|| format!("Invalid config: {:?}", path))
    }

    /// Apply overrides from an environment lookup
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(STORE_DIR_ENV).filter(|d| !d.is_empty()) {
            self.store_dir = PathBuf::from(dir);
        }
        self
    }

    pub fn controller_config(&self, feature: Feature) -> ControllerConfig {
        let mut config = ControllerConfig::for_feature(feature, self.owner_id.clone());
        config.throttle_interval = Duration::from_millis(self.throttle_interval_ms);
        config.replay_chunk_size = self.replay_chunk_size;
        config.replay_delay = Duration::from_millis(self.replay_delay_ms);
        config
    }
}

fn default_store_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("genstream")
        .join("store")
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("genstream").join("config.yaml"))
}
