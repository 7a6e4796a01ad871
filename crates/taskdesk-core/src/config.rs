//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! the API endpoint, where the session is persisted, and the request and
//! session timing policies.
//!
//! Configuration is stored at `~/.config/taskdesk/config.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::RequestPolicy;
use crate::auth::SessionPolicy;
use crate::storage::{FileStore, KeyValueStore, KeyringStore, MemoryStore};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "taskdesk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// API used when nothing is configured
const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api";

/// Origin sent with every request when nothing is configured
const DEFAULT_ORIGIN: &str = "http://localhost:3000";

/// Where the session is kept between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSettings {
    pub timeout_ms: u64,
    pub retries: u32,
    pub backoff_ms: u64,
}

impl Default for RequestSettings {
    fn default() -> Self {
        let policy = RequestPolicy::default();
        Self {
            timeout_ms: policy.timeout.as_millis() as u64,
            retries: policy.retries,
            backoff_ms: policy.backoff_step.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub refresh_horizon_secs: u64,
    pub expiry_check_interval_secs: u64,
    pub inactivity_timeout_secs: u64,
    pub inactivity_warning_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let policy = SessionPolicy::default();
        Self {
            refresh_horizon_secs: policy.refresh_horizon.as_secs(),
            expiry_check_interval_secs: policy.expiry_check_interval.as_secs(),
            inactivity_timeout_secs: policy.inactivity_timeout.as_secs(),
            inactivity_warning_secs: policy.inactivity_warning.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub origin: String,
    pub storage: StorageBackend,
    pub last_email: Option<String>,
    pub request: RequestSettings,
    pub session: SessionSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            storage: StorageBackend::default(),
            last_email: None,
            request: RequestSettings::default(),
            session: SessionSettings::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn request_policy(&self) -> RequestPolicy {
        RequestPolicy {
            timeout: Duration::from_millis(self.request.timeout_ms),
            retries: self.request.retries,
            backoff_step: Duration::from_millis(self.request.backoff_ms),
        }
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            refresh_horizon: Duration::from_secs(self.session.refresh_horizon_secs),
            expiry_check_interval: Duration::from_secs(self.session.expiry_check_interval_secs),
            inactivity_timeout: Duration::from_secs(self.session.inactivity_timeout_secs),
            inactivity_warning: Duration::from_secs(self.session.inactivity_warning_secs),
        }
    }

    /// Open the configured durable medium for the session.
    pub fn open_storage(&self) -> Result<Arc<dyn KeyValueStore>> {
        let medium: Arc<dyn KeyValueStore> = match self.storage {
            StorageBackend::File => Arc::new(FileStore::new(self.cache_dir()?)),
            StorageBackend::Keyring => Arc::new(KeyringStore::new()),
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
        };
        Ok(medium)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"api_base_url": "https://tasks.example.com/api", "request": {"retries": 1}}"#)
                .unwrap();
        assert_eq!(config.api_base_url, "https://tasks.example.com/api");
        assert_eq!(config.origin, DEFAULT_ORIGIN);
        assert_eq!(config.storage, StorageBackend::File);

        let policy = config.request_policy();
        assert_eq!(policy.retries, 1);
        assert_eq!(policy.timeout, Duration::from_secs(10));
        assert_eq!(policy.backoff_step, Duration::from_millis(1000));
    }

    #[test]
    fn test_default_session_policy() {
        assert_eq!(Config::default().session_policy(), SessionPolicy::default());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let config = Config {
            storage: StorageBackend::Keyring,
            last_email: Some("ada@example.com".to_string()),
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, Config::default());
    }
}
