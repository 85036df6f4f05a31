//! Configuration types for the frame cache.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{CACHE_VERSION, CompressionType};

fn default_version() -> u32 {
    CACHE_VERSION
}

fn default_delta() -> bool {
    cfg!(feature = "delta")
}

fn default_sweep_interval() -> u64 {
    3_600
}

/// Top-level cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding the map/data file pairs.
    pub cache_dir: PathBuf,
    /// Cache format version encoded into every file name.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Compression applied to every cached frame.
    #[serde(default)]
    pub compression: CompressionType,
    /// XOR each frame against the previous one before compressing.
    #[serde(default = "default_delta")]
    pub delta: bool,
    /// Seconds between background eviction sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("lotcache"),
            version: CACHE_VERSION,
            compression: CompressionType::default(),
            delta: default_delta(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl CacheConfig {
    /// Configuration rooted at `cache_dir` with all other values defaulted.
    pub fn new<P: Into<PathBuf>>(cache_dir: P) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Default::default()
        }
    }

    #[inline]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyCacheDir);
        }
        if self.version == 0 {
            return Err(ConfigError::InvalidVersion);
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidSweepInterval);
        }
        #[cfg(not(feature = "lz4"))]
        if self.compression == CompressionType::Lz4 {
            return Err(ConfigError::CompressionUnavailable(self.compression));
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cache directory must not be empty")]
    EmptyCacheDir,
    #[error("Cache version must be non-zero")]
    InvalidVersion,
    #[error("Sweep interval must be positive")]
    InvalidSweepInterval,
    #[error("Compression {0:?} is not compiled into this build")]
    CompressionUnavailable(CompressionType),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_json() {
        let config: CacheConfig = serde_json::from_str(r#"{"cache_dir": "/tmp/lot"}"#).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/lot"));
        assert_eq!(config.version, CACHE_VERSION);
        assert_eq!(config.sweep_interval_secs, 3_600);
        assert_eq!(config.delta, cfg!(feature = "delta"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = CacheConfig::new("/tmp/lot");
        config.sweep_interval_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSweepInterval)
        ));

        let mut config = CacheConfig::new("");
        assert!(matches!(config.validate(), Err(ConfigError::EmptyCacheDir)));
        config.cache_dir = PathBuf::from("/tmp/lot");
        config.version = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidVersion)));
    }
}
