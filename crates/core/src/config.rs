//! Configuration management
//!
//! The configuration file holds transfer tuning, retry policy and alias
//! definitions. It is stored as TOML at `$OBJSYNC_CONFIG_DIR/config.toml`,
//! falling back to the platform config directory.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::alias::Alias;
use crate::error::{Error, Result};

/// Current configuration schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Backend ceiling for keys per delete-batch call and objects per list page
pub const MAX_BATCH_SIZE: usize = 1000;

/// Backend ceiling for parts per multipart upload
pub const MAX_PARTS: u64 = 10_000;

const MIB: u64 = 1024 * 1024;

/// Tuning knobs for the transfer engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Keys per delete-batch call (clamped to 1000)
    pub max_batch_size: usize,

    /// Concurrent delete-batch calls
    pub delete_parallelism: usize,

    /// Buffered keys that trigger an automatic flush in the optimized deleter
    pub auto_flush_size: usize,

    /// Multipart part size in bytes
    pub part_size: u64,

    /// Concurrent part uploads
    pub upload_concurrency: usize,

    /// Objects at or above this size use multipart upload
    pub multipart_threshold: u64,

    /// Objects per list page (clamped to 1000)
    pub page_size: usize,

    /// Concurrent prefix listings
    pub list_parallelism: usize,

    /// Concurrent file uploads during sync
    pub sync_parallelism: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_batch_size: MAX_BATCH_SIZE,
            delete_parallelism: 5,
            auto_flush_size: MAX_BATCH_SIZE,
            part_size: 5 * MIB,
            upload_concurrency: 5,
            multipart_threshold: 100 * MIB,
            page_size: MAX_BATCH_SIZE,
            list_parallelism: 5,
            sync_parallelism: 4,
        }
    }
}

impl TransferConfig {
    /// Reject settings the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("max_batch_size", self.max_batch_size as u64),
            ("auto_flush_size", self.auto_flush_size as u64),
            ("part_size", self.part_size),
            ("page_size", self.page_size as u64),
        ];
        for (name, value) in zero {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    /// Delete batch size clamped to the backend ceiling
    pub fn batch_size(&self) -> usize {
        clamp_batch(self.max_batch_size)
    }

    /// List page size clamped to the backend ceiling
    pub fn effective_page_size(&self) -> usize {
        clamp_batch(self.page_size)
    }
}

/// Clamp a batch or page size into `1..=MAX_BATCH_SIZE`
pub fn clamp_batch(size: usize) -> usize {
    size.clamp(1, MAX_BATCH_SIZE)
}

/// Worker count, substituting the default when unset
pub fn parallelism_or_default(parallelism: usize) -> usize {
    if parallelism == 0 { 5 } else { parallelism }
}

/// Retry policy for transient backend failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Backoff before the second attempt
    pub initial_backoff_ms: u64,
    /// Upper bound for a single backoff
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10000,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schema_version: u32,
    pub transfer: TransferConfig,
    pub retry: RetryConfig,
    pub aliases: Vec<Alias>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            transfer: TransferConfig::default(),
            retry: RetryConfig::default(),
            aliases: Vec::new(),
        }
    }
}

/// Loads and saves the configuration file
#[derive(Debug, Clone)]
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    /// Manager for the default config location
    pub fn new() -> Result<Self> {
        Ok(Self {
            path: Self::default_path()?,
        })
    }

    /// Manager for an explicit file (used by tests)
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn default_path() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("OBJSYNC_CONFIG_DIR") {
            return Ok(PathBuf::from(dir).join("config.toml"));
        }

        dirs::config_dir()
            .map(|d| d.join("objsync").join("config.toml"))
            .ok_or_else(|| Error::Config("Cannot determine config directory".to_string()))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Load the config, returning defaults when the file does not exist
    pub fn load(&self) -> Result<Config> {
        if !self.path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(&self.path)?;
        let config: Config = toml::from_str(&content)?;

        if config.schema_version > SCHEMA_VERSION {
            return Err(Error::Config(format!(
                "Unsupported config schema version {} (max {SCHEMA_VERSION})",
                config.schema_version
            )));
        }
        config.transfer.validate()?;

        Ok(config)
    }

    /// Write the config, creating parent directories
    pub fn save(&self, config: &Config) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(config)?;
        std::fs::write(&self.path, content)?;
        tracing::debug!(path = %self.path.display(), "Saved configuration");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_transfer_defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.max_batch_size, 1000);
        assert_eq!(config.delete_parallelism, 5);
        assert_eq!(config.part_size, 5 * 1024 * 1024);
        assert_eq!(config.upload_concurrency, 5);
        assert_eq!(config.multipart_threshold, 100 * 1024 * 1024);
        assert_eq!(config.page_size, 1000);
        assert_eq!(config.list_parallelism, 5);
    }

    #[test]
    fn test_batch_size_clamped() {
        let config = TransferConfig {
            max_batch_size: 5000,
            page_size: 2000,
            ..Default::default()
        };
        assert_eq!(config.batch_size(), 1000);
        assert_eq!(config.effective_page_size(), 1000);
        assert_eq!(clamp_batch(0), 1);
    }

    #[test]
    fn test_parallelism_default() {
        assert_eq!(parallelism_or_default(0), 5);
        assert_eq!(parallelism_or_default(12), 12);
    }

    #[test]
    fn test_validate_rejects_zero_part_size() {
        let config = TransferConfig {
            part_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_missing_returns_default() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("config.toml"));
        let config = manager.load().unwrap();
        assert_eq!(config.schema_version, SCHEMA_VERSION);
        assert!(config.aliases.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("nested").join("config.toml"));

        let mut config = Config::default();
        config.transfer.delete_parallelism = 9;
        config.aliases.push(Alias::new("local", "http://localhost:9000", "ak", "sk"));
        manager.save(&config).unwrap();

        let loaded = manager.load().unwrap();
        assert_eq!(loaded.transfer.delete_parallelism, 9);
        assert_eq!(loaded.aliases.len(), 1);
        assert_eq!(loaded.aliases[0].name, "local");
    }

    #[test]
    fn test_partial_transfer_section() {
        let parsed: Config = toml::from_str(
            r#"
            [transfer]
            part_size = 8388608
            "#,
        )
        .unwrap();
        assert_eq!(parsed.transfer.part_size, 8 * 1024 * 1024);
        assert_eq!(parsed.transfer.upload_concurrency, 5);
    }
}
