//! Settings the download service is built from.
//!
//! How and when the settings file is read is up to the embedding application;
//! this module only defines the shape, the defaults and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::ApiConfig;

/// Smallest allowed pool size.
pub const MIN_PARALLEL_DOWNLOADS: usize = 1;

/// Largest allowed pool size.
pub const MAX_PARALLEL_DOWNLOADS: usize = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(
        "maxParallelDownloads must be between {MIN_PARALLEL_DOWNLOADS} and {MAX_PARALLEL_DOWNLOADS}, got {0}"
    )]
    InvalidParallelism(usize),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadConfig {
    /// Size of the pool for ordinary downloads
    pub max_parallel_downloads: usize,
    pub download_directory: PathBuf,
    /// Minimum spacing between two task starts
    pub pacing_interval_ms: u64,
    /// Extra wait before retrying a location whose previous transfer was interrupted
    pub interrupt_penalty_ms: u64,
    pub api: ApiConfig,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_parallel_downloads: 10,
            download_directory: PathBuf::from("downloads"),
            pacing_interval_ms: 1000,
            interrupt_penalty_ms: 5000,
            api: ApiConfig::default(),
        }
    }
}

impl DownloadConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_PARALLEL_DOWNLOADS..=MAX_PARALLEL_DOWNLOADS).contains(&self.max_parallel_downloads)
        {
            return Err(ConfigError::InvalidParallelism(self.max_parallel_downloads));
        }
        Ok(())
    }

    pub fn pacing_interval(&self) -> Duration {
        Duration::from_millis(self.pacing_interval_ms)
    }

    pub fn interrupt_penalty(&self) -> Duration {
        Duration::from_millis(self.interrupt_penalty_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = DownloadConfig::from_json_str(
            r#"{"maxParallelDownloads": 3, "api": {"proxy": {"host": "proxy.local", "port": 3128}}}"#,
        )
        .unwrap();
        assert_eq!(config.max_parallel_downloads, 3);
        assert_eq!(config.pacing_interval(), Duration::from_secs(1));
        assert_eq!(config.interrupt_penalty(), Duration::from_secs(5));
        assert_eq!(config.api.proxy.unwrap().port, 3128);
        assert_eq!(config.api.client_name, "htmlshark");
    }

    #[test]
    fn test_rejects_zero_parallelism() {
        let err = DownloadConfig::from_json_str(r#"{"maxParallelDownloads": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParallelism(0)));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"downloadDirectory": "/music"}"#).unwrap();
        let config = DownloadConfig::from_json_file(&path).unwrap();
        assert_eq!(config.download_directory, PathBuf::from("/music"));

        let missing = DownloadConfig::from_json_file(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
