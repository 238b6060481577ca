//! Engine configuration
//!
//! Paths default to the platform data directory; `from_env` lets a host or
//! a test override them without code changes.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const MODELS_DIR_ENV: &str = "LOCAL_LLM_MODELS_DIR";
pub const DB_PATH_ENV: &str = "LOCAL_LLM_DB_PATH";
pub const SIDECAR_ENV: &str = "LOCAL_LLM_SIDECAR";

const APP_DIR: &str = "local-llm";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding downloaded GGUF files
    pub models_dir: PathBuf,
    /// SQLite file for per-model settings
    pub database_path: PathBuf,
    /// Inference sidecar binary; searched for when unset
    pub sidecar_path: Option<PathBuf>,
    #[serde(with = "duration_secs")]
    pub download_timeout: Duration,
    /// Minimum gap between progress callbacks when the percentage is unchanged
    #[serde(with = "duration_millis")]
    pub progress_interval: Duration,
    #[serde(with = "duration_millis")]
    pub hardware_cache_ttl: Duration,
    /// Chunks a stream may hold before the producer waits for the consumer
    pub stream_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        Self::rooted_at(root)
    }
}

impl EngineConfig {
    /// Defaults with every path under `root`
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            models_dir: root.join("models"),
            database_path: root.join("settings.sqlite"),
            sidecar_path: None,
            download_timeout: Duration::from_secs(3600),
            progress_interval: Duration::from_millis(500),
            hardware_cache_ttl: Duration::from_secs(5),
            stream_buffer: 1,
        }
    }

    /// Defaults overridden by `LOCAL_LLM_*` environment variables
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var_os(key).map(PathBuf::from))
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<PathBuf>) -> Self {
        if let Some(dir) = lookup(MODELS_DIR_ENV) {
            self.models_dir = dir;
        }
        if let Some(path) = lookup(DB_PATH_ENV) {
            self.database_path = path;
        }
        if let Some(path) = lookup(SIDECAR_ENV) {
            self.sidecar_path = Some(path);
        }
        self
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
