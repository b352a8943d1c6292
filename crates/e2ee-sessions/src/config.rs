use crate::{Error, FileStorageAdapter, InMemoryStorage, Result, StorageAdapter};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Per-client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct E2eeConfig {
    /// Fully qualified user id, e.g. `@alice:example.org`
    pub user_id: String,

    /// This client's device id
    pub device_id: String,

    /// Number of one-time keys to keep published on the server
    #[serde(default = "default_one_time_key_count")]
    pub one_time_key_count: usize,

    /// Directory for persisted device lists and sessions; in memory if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
}

fn default_one_time_key_count() -> usize {
    50
}

impl E2eeConfig {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            one_time_key_count: default_one_time_key_count(),
            store_path: None,
        }
    }

    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        let config: E2eeConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.user_id.starts_with('@') || !self.user_id.contains(':') {
            return Err(Error::Config(format!("Invalid user id: {}", self.user_id)));
        }
        if self.device_id.is_empty() {
            return Err(Error::Config("Device id must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn open_storage(&self) -> Result<Arc<dyn StorageAdapter>> {
        Ok(match &self.store_path {
            Some(path) => Arc::new(FileStorageAdapter::new(path.clone())?),
            None => Arc::new(InMemoryStorage::new()),
        })
    }
}
