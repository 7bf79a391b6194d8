//! Configuration management for mediagrab.
//!
//! Configuration can be set via environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `8080`.
//! - `STORAGE_DIR` - Optional. Directory for downloaded files. Defaults to
//!   `<system temp>/mediagrab`.
//! - `YTDLP_PATH` - Optional. Path to the yt-dlp binary. Defaults to `yt-dlp`.
//! - `MAX_CONCURRENT_DOWNLOADS` - Optional. Worker pool size. Defaults to `4`.
//! - `MAX_ATTEMPTS` - Optional. Attempts per task before giving up. Defaults to `3`.
//! - `RETRY_BACKOFF_SECS` - Optional. Base of the exponential backoff. Defaults to `2`.
//! - `INFO_TIMEOUT_SECS` - Optional. Metadata query timeout. Defaults to `60`.
//! - `DOWNLOAD_TIMEOUT_SECS` - Optional. Per-attempt download timeout. Defaults to `3600`.
//! - `TERMINAL_TTL_SECS` - Optional. How long finished tasks stay pollable. Defaults to `600`.
//! - `TASK_MAX_AGE_SECS` - Optional. Force-eviction age for any task. Defaults to `3600`.
//! - `ORPHAN_TTL_SECS` - Optional. Age after which unreferenced files are deleted. Defaults to `3600`.
//! - `CLEANUP_INTERVAL_SECS` - Optional. Cleanup pass interval. Defaults to `60`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Directory where the engine writes files and artifacts are served from
    pub storage_dir: PathBuf,

    /// Path to the yt-dlp binary
    pub ytdlp_path: String,

    /// Maximum number of downloads running at once
    pub max_concurrent: usize,

    /// Attempts per task, counting the first one
    pub max_attempts: u32,

    /// Base of the exponential retry backoff, in seconds
    pub backoff_base_secs: u64,

    /// Timeout for the metadata-only engine query, in seconds
    pub info_timeout_secs: u64,

    /// Timeout for a single download attempt, in seconds
    pub download_timeout_secs: u64,

    /// Completed/failed tasks older than this are evicted
    pub terminal_ttl_secs: u64,

    /// Any task older than this is force-evicted, whatever its state
    pub task_max_age_secs: u64,

    /// Unreferenced files older than this are deleted
    pub orphan_ttl_secs: u64,

    /// Interval between cleanup passes
    pub cleanup_interval_secs: u64,
}

fn env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` when a numeric variable fails to
    /// parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;

        let storage_dir = std::env::var("STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("mediagrab"));

        let ytdlp_path = std::env::var("YTDLP_PATH").unwrap_or_else(|_| "yt-dlp".to_string());

        let max_concurrent = env_u64("MAX_CONCURRENT_DOWNLOADS", 4)?.max(1) as usize;
        let max_attempts = env_u64("MAX_ATTEMPTS", 3)?.max(1) as u32;

        Ok(Self {
            host,
            port,
            storage_dir,
            ytdlp_path,
            max_concurrent,
            max_attempts,
            backoff_base_secs: env_u64("RETRY_BACKOFF_SECS", 2)?,
            info_timeout_secs: env_u64("INFO_TIMEOUT_SECS", 60)?,
            download_timeout_secs: env_u64("DOWNLOAD_TIMEOUT_SECS", 3600)?,
            terminal_ttl_secs: env_u64("TERMINAL_TTL_SECS", 600)?,
            task_max_age_secs: env_u64("TASK_MAX_AGE_SECS", 3600)?,
            orphan_ttl_secs: env_u64("ORPHAN_TTL_SECS", 3600)?,
            cleanup_interval_secs: env_u64("CLEANUP_INTERVAL_SECS", 60)?,
        })
    }

    /// Create a config rooted at the given storage directory (useful for testing).
    pub fn for_tests(storage_dir: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            storage_dir,
            ytdlp_path: "yt-dlp".to_string(),
            max_concurrent: 2,
            max_attempts: 3,
            backoff_base_secs: 0,
            info_timeout_secs: 5,
            download_timeout_secs: 30,
            terminal_ttl_secs: 600,
            task_max_age_secs: 3600,
            orphan_ttl_secs: 3600,
            cleanup_interval_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::for_tests(PathBuf::from("/tmp/mediagrab-test"));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_base_secs, 0);
        assert_eq!(config.storage_dir, PathBuf::from("/tmp/mediagrab-test"));
    }
}
