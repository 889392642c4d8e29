//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file with `BACKUP_ENGINE__*` environment
//! variable overrides (e.g. `BACKUP_ENGINE__ENGINE__WORKERS=8`).

use crate::replicate::{BackendConfig, DestinationProvider, StorageDestination};
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "BACKUP_ENGINE";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub crypto: CryptoConfig,

    #[serde(default)]
    pub log: LogConfig,

    /// Replication targets, referenced by name from jobs
    #[serde(default)]
    pub destinations: BTreeMap<String, DestinationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Working directory for the metadata store and keys
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// SQLite file (defaults to `<data_dir>/engine.db`)
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Master key and manifest signing keys (defaults to `<data_dir>/keys`)
    #[serde(default)]
    pub keys_dir: Option<PathBuf>,

    /// Size of each per-step worker pool
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Seconds one destination may take to accept an archive
    #[serde(default = "default_replication_timeout_secs")]
    pub replication_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Fixed block size in bytes (default: 4KB)
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Number of block hashes kept in the in-memory cache
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Payloads below this size are stored raw
    #[serde(default = "default_min_size")]
    pub min_size: usize,

    /// Zstandard level (1-22)
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,

    /// Gzip level (0-9)
    #[serde(default = "default_gzip_level")]
    pub gzip_level: u32,

    /// Bzip2 level (1-9)
    #[serde(default = "default_bzip2_level")]
    pub bzip2_level: u32,

    /// Benchmark all algorithms on text payloads and keep the best ratio
    #[serde(default = "default_true")]
    pub benchmark_text: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// PBKDF2-HMAC-SHA256 rounds for password-derived keys
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub backend: BackendConfig,
}

// Default values
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/backup-engine")
}

fn default_workers() -> usize {
    4
}

fn default_replication_timeout_secs() -> u64 {
    1800
}

fn default_block_size() -> usize {
    4096
}

fn default_cache_capacity() -> u64 {
    100_000
}

fn default_min_size() -> usize {
    1024
}

fn default_zstd_level() -> i32 {
    3
}

fn default_gzip_level() -> u32 {
    6
}

fn default_bzip2_level() -> u32 {
    6
}

fn default_true() -> bool {
    true
}

fn default_pbkdf2_iterations() -> u32 {
    100_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_path: None,
            keys_dir: None,
            workers: default_workers(),
            replication_timeout_secs: default_replication_timeout_secs(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            zstd_level: default_zstd_level(),
            gzip_level: default_gzip_level(),
            bzip2_level: default_bzip2_level(),
            benchmark_text: true,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: default_pbkdf2_iterations(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from an optional TOML file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(EngineError::config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let config: EngineConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| EngineError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults rooted at `data_dir`; used by tests and `init-config`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.engine.data_dir = data_dir.into();
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.dedup.block_size == 0 {
            return Err(EngineError::config("dedup.block_size must be greater than zero"));
        }
        if self.engine.workers == 0 {
            return Err(EngineError::config("engine.workers must be greater than zero"));
        }
        if self.engine.replication_timeout_secs == 0 {
            return Err(EngineError::config(
                "engine.replication_timeout_secs must be greater than zero",
            ));
        }
        if self.crypto.pbkdf2_iterations == 0 {
            return Err(EngineError::config("crypto.pbkdf2_iterations must be greater than zero"));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.engine
            .db_path
            .clone()
            .unwrap_or_else(|| self.engine.data_dir.join("engine.db"))
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.engine
            .keys_dir
            .clone()
            .unwrap_or_else(|| self.engine.data_dir.join("keys"))
    }

    /// Render as TOML (used to write a starter config file)
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::config(e.to_string()))
    }
}

impl DestinationProvider for EngineConfig {
    fn destination(&self, name: &str) -> Option<StorageDestination> {
        self.destinations.get(name).map(|d| StorageDestination {
            name: name.to_string(),
            enabled: d.enabled,
            backend: d.backend.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replicate::DestinationKind;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.dedup.block_size, 4096);
        assert_eq!(config.compression.min_size, 1024);
        assert_eq!(config.crypto.pbkdf2_iterations, 100_000);
        assert_eq!(config.engine.replication_timeout_secs, 1800);
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/backup-engine/engine.db"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file_with_destinations() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("engine.toml");
        fs::write(
            &path,
            r#"
[engine]
data_dir = "/srv/backup-engine"
workers = 2
replication_timeout_secs = 120

[dedup]
block_size = 8192

[destinations.nas]
kind = "local"
path = "/mnt/nas"

[destinations.offsite]
kind = "sftp"
enabled = false
host = "backup.example.com"
username = "backup"
"#,
        )?;

        let config = EngineConfig::load(Some(&path))?;
        assert_eq!(config.engine.workers, 2);
        assert_eq!(config.engine.replication_timeout_secs, 120);
        assert_eq!(config.dedup.block_size, 8192);
        assert_eq!(config.keys_dir(), PathBuf::from("/srv/backup-engine/keys"));

        let nas = config.destination("nas").expect("nas destination");
        assert_eq!(nas.kind(), DestinationKind::Local);
        assert!(nas.enabled);

        let offsite = config.destination("offsite").expect("offsite destination");
        assert_eq!(offsite.kind(), DestinationKind::Sftp);
        assert!(!offsite.enabled);

        assert!(config.destination("missing").is_none());
        Ok(())
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let result = EngineConfig::load(Some(Path::new("/nonexistent/engine.toml")));
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let mut config = EngineConfig::default();
        config.dedup.block_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_replication_timeout_rejected() {
        let mut config = EngineConfig::default();
        config.engine.replication_timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
