//! Runtime configuration.
//!
//! Loaded from `~/.brainstore/config.json`; a missing file means
//! defaults, a malformed file is an error. Every field has a serde
//! default so partial configs stay valid across releases.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BrainError, Result};

pub const CONFIG_DIR_NAME: &str = ".brainstore";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub max_processing_time_ms: u64,
    pub stuck_sweep_interval_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval_ms: 1_000,
            max_processing_time_ms: 300_000,
            stuck_sweep_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSettings {
    pub default_max_retries: i64,
    /// Terminal jobs older than this are garbage-collected.
    pub cleanup_max_age_hours: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            cleanup_max_age_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmbeddingSettings {
    pub dimension: usize,
    /// Where fastembed caches the downloaded model. Relative to the data
    /// dir when unset.
    pub model_cache_dir: Option<PathBuf>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            dimension: crate::embeddings::DEFAULT_DIMENSION,
            model_cache_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrainConfig {
    /// Home of the database and model cache. Defaults to `~/.brainstore`.
    pub data_dir: Option<PathBuf>,
    pub worker: WorkerSettings,
    pub queue: QueueSettings,
    pub embeddings: EmbeddingSettings,
}

impl BrainConfig {
    /// Load from `~/.brainstore/config.json`. Missing file → defaults.
    pub fn load() -> Result<Self> {
        match default_data_dir() {
            Some(dir) => Self::load_from(&dir.join(CONFIG_FILE_NAME)),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            BrainError::Serialization(format!("config {}: {e}", path.display()))
        })
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        default_data_dir().ok_or_else(|| {
            BrainError::Validation("home directory not found; set dataDir".to_string())
        })
    }

    pub fn model_cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.embeddings.model_cache_dir {
            return Ok(dir.clone());
        }
        Ok(self.data_dir()?.join("models"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker.poll_interval_ms)
    }

    pub fn max_processing_time(&self) -> Duration {
        Duration::from_millis(self.worker.max_processing_time_ms)
    }

    pub fn stuck_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.worker.stuck_sweep_interval_ms)
    }

    pub fn cleanup_max_age(&self) -> Duration {
        Duration::from_secs(self.queue.cleanup_max_age_hours * 3_600)
    }
}

fn default_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR_NAME))
}
