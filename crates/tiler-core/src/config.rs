//! Configuration module

use crate::{Error, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tiler_store::{StoreBackend, StoreConfig};

/// Default bucket receiving tile sets
pub const DEFAULT_UPLOAD_BUCKET: &str = "histoflow-tiles";

/// Default parent directory of per-job working areas
pub const DEFAULT_TEMP_STORAGE_PATH: &str = "/tmp/histoflow_tiling";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Object store connection
    #[serde(default)]
    pub storage: StorageConfig,
    /// Tile destination
    #[serde(default)]
    pub upload: UploadConfig,
    /// Local scratch space
    #[serde(default)]
    pub tiling: TilingConfig,
    /// Job concurrency limits
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub tuning: StoreConfig,
}

/// Upload configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Bucket receiving `{image_id}/...` tile sets
    pub bucket: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_UPLOAD_BUCKET.to_string(),
        }
    }
}

/// Tiling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingConfig {
    /// Parent of the per-job working areas
    pub temp_storage_path: PathBuf,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            temp_storage_path: PathBuf::from(DEFAULT_TEMP_STORAGE_PATH),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Jobs running at the same time
    pub max_concurrent_jobs: usize,
    /// Accepted jobs waiting for a worker slot
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            queue_capacity: 64,
        }
    }
}

impl ServiceConfig {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = config_dir()
            .ok_or_else(|| Error::Config("Unable to determine config directory".to_string()))?;

        Ok(config_dir.join("histoflow-tiler").join("config.toml"))
    }

    /// Get default configuration content with examples
    pub fn default_config_content() -> String {
        format!(
            r#"# HistoFlow tiler configuration

[storage.backend]
# Object store backend: memory, local, s3
kind = "local"
# Directory holding one sub-directory per bucket
root = "/var/lib/histoflow/buckets"

# MinIO / S3-compatible service instead:
# kind = "s3"
# endpoint = "http://localhost:9000"
# region = "us-east-1"
# access_key = "minioadmin"
# secret_key = "minioadmin"
# allow_http = true

[storage.tuning]
# Files above this size (bytes) are uploaded in parts
multipart_threshold = 67108864
part_size = 8388608
max_concurrent_parts = 4

[upload]
# Bucket receiving {{image_id}}/image.dzi, tiles and metadata.json
bucket = "{DEFAULT_UPLOAD_BUCKET}"

[tiling]
# Per-job working areas are created under this directory
temp_storage_path = "{DEFAULT_TEMP_STORAGE_PATH}"

[scheduler]
# Jobs running at the same time
max_concurrent_jobs = 2
# Accepted jobs waiting for a worker slot
queue_capacity = 64
"#
        )
    }

    /// Load configuration from the default location, writing the commented
    /// default file when none exists yet
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, Self::default_config_content())?;
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: ServiceConfig = toml::from_str(contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.upload.bucket.trim().is_empty() {
            return Err(Error::Config("upload.bucket must not be empty".to_string()));
        }
        if self.scheduler.max_concurrent_jobs == 0 {
            return Err(Error::Config(
                "scheduler.max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if self.scheduler.queue_capacity == 0 {
            return Err(Error::Config(
                "scheduler.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.storage.tuning.part_size < 5 * 1024 * 1024 {
            return Err(Error::Config(
                "storage.tuning.part_size must be at least 5MB".to_string(),
            ));
        }
        Ok(())
    }
}
