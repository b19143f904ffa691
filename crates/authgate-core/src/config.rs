//! Application configuration management.
//!
//! Configuration is stored at `~/.config/authgate/config.json` (or the
//! platform equivalent) and may be overridden from the environment.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::gateway::DEFAULT_REQUEST_TIMEOUT_SECS;
use crate::guard::{DEFAULT_HOME_PATH, DEFAULT_SIGN_IN_PATH};
use crate::manager::SessionManagerConfig;
use crate::provider::http::DEFAULT_AUTH_TIMEOUT_SECS;
use crate::session::DEFAULT_REFRESH_BUFFER_SECS;
use crate::store::{FileStore, KeyValueStore, KeyringStore, MemoryStore};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "authgate";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const ENV_AUTH_URL: &str = "AUTHGATE_AUTH_URL";
pub const ENV_API_URL: &str = "AUTHGATE_API_URL";
pub const ENV_USERNAME: &str = "AUTHGATE_USERNAME";

/// Where the session record is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// JSON file next to the config.
    #[default]
    File,
    /// OS keychain.
    Keyring,
    /// Not persisted; every run starts signed out.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub auth_base_url: String,
    pub api_base_url: String,
    pub auth_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub refresh_buffer_secs: i64,
    pub storage: StorageKind,
    pub sign_in_path: String,
    pub home_path: String,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth_base_url: "http://localhost:8000/api/v1/auth".to_string(),
            api_base_url: "http://localhost:8000/api/v1".to_string(),
            auth_timeout_secs: DEFAULT_AUTH_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            refresh_buffer_secs: DEFAULT_REFRESH_BUFFER_SECS,
            storage: StorageKind::default(),
            sign_in_path: DEFAULT_SIGN_IN_PATH.to_string(),
            home_path: DEFAULT_HOME_PATH.to_string(),
            last_username: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides on top of the file values.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = non_empty(ENV_AUTH_URL) {
            self.auth_base_url = url;
        }
        if let Some(url) = non_empty(ENV_API_URL) {
            self.api_base_url = url;
        }
        if let Some(username) = non_empty(ENV_USERNAME) {
            self.last_username = Some(username);
        }
    }

    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME))
    }

    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE))
    }

    fn app_cache_dir() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Root of the per-user data cache. Wiped on sign-out.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        Ok(Self::app_cache_dir()?.join("data"))
    }

    /// Directory for rolling log files, kept apart from the data cache.
    pub fn log_dir(&self) -> Result<PathBuf> {
        Ok(Self::app_cache_dir()?.join("logs"))
    }

    /// Backend for the token store, per `storage`.
    pub fn session_backend(&self) -> Result<Arc<dyn KeyValueStore>> {
        Ok(match self.storage {
            StorageKind::File => Arc::new(FileStore::new(Self::config_dir()?)),
            StorageKind::Keyring => Arc::new(KeyringStore::new()),
            StorageKind::Memory => Arc::new(MemoryStore::new()),
        })
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn manager_config(&self) -> SessionManagerConfig {
        SessionManagerConfig {
            auth_timeout: self.auth_timeout(),
            refresh_buffer: chrono::Duration::try_seconds(self.refresh_buffer_secs.max(0))
                .unwrap_or_else(|| chrono::Duration::seconds(DEFAULT_REFRESH_BUFFER_SECS)),
        }
    }
}
