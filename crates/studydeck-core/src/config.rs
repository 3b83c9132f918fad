//! Client configuration management.
//!
//! This module handles loading and saving the client configuration: which
//! API server to talk to, request timeout and retry limits, where shared
//! storage lives, and how often other tabs' changes are polled.
//!
//! Configuration is stored at `~/.config/studydeck/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/data directory paths
const APP_NAME: &str = "studydeck";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Shared storage file name
const STORAGE_FILE: &str = "storage.json";

const DEFAULT_API_BASE_URL: &str = "http://localhost:3000";

/// HTTP request timeout in seconds. Applies to every call, refresh included.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const DEFAULT_MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// How often file storage is polled for other processes' writes.
const DEFAULT_SYNC_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub max_rate_limit_retries: u32,
    /// Override for the shared storage file location
    pub storage_path: Option<PathBuf>,
    pub sync_interval_ms: u64,
    /// Write logs to a daily rolling file in this directory instead of stderr
    pub log_dir: Option<PathBuf>,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_rate_limit_retries: DEFAULT_MAX_RATE_LIMIT_RETRIES,
            storage_path: None,
            sync_interval_ms: DEFAULT_SYNC_INTERVAL_MS,
            log_dir: None,
            last_email: None,
        }
    }
}

impl Config {
    /// Config pointing at `api_base_url` with every other setting defaulted.
    pub fn for_server(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn storage_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.storage_path {
            return Ok(path.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME).join(STORAGE_FILE))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.max(1))
    }

    /// Absolute URL for an API path. Tolerates a trailing slash on the base
    /// and a missing leading slash on the path.
    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api_base_url, "http://localhost:3000");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_rate_limit_retries, 3);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"api_base_url":"https://study.example.com"}"#).unwrap();
        assert_eq!(config.api_base_url, "https://study.example.com");
        assert_eq!(config.sync_interval_ms, 500);
        assert_eq!(config.last_email, None);
    }

    #[test]
    fn test_url_for_joins_cleanly() {
        let config = Config::for_server("https://study.example.com/");
        assert_eq!(config.url_for("/api/users/me"), "https://study.example.com/api/users/me");
        assert_eq!(config.url_for("api/cards"), "https://study.example.com/api/cards");
    }

    #[test]
    fn test_storage_path_override() {
        let config = Config {
            storage_path: Some(PathBuf::from("/tmp/deck/storage.json")),
            ..Config::default()
        };
        assert_eq!(config.storage_path().unwrap(), PathBuf::from("/tmp/deck/storage.json"));
    }

    #[test]
    fn test_sync_interval_never_zero() {
        let config = Config {
            sync_interval_ms: 0,
            ..Config::default()
        };
        assert_eq!(config.sync_interval(), Duration::from_millis(1));
    }
}
