//! Configuration Storage
//!
//! Handles reading/writing the bridge configuration file.
//! Config location: the platform config directory (`~/.config/ssm-bridge` on
//! Linux), falling back to `~/.ssm-bridge`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::forwarding::{DEFAULT_CHUNK_SIZE, DEFAULT_PORT_OFFSET, DEFAULT_PORT_TRIES};
use crate::session::DEFAULT_HELPER;
use crate::ssh::{DEFAULT_ACCEPT_ATTEMPTS, DEFAULT_ACCEPT_TIMEOUT};

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Get the bridge configuration directory
pub fn config_dir() -> Result<PathBuf, StorageError> {
    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join("ssm-bridge"));
    }
    dirs::home_dir()
        .map(|home| home.join(".ssm-bridge"))
        .ok_or(StorageError::NoConfigDir)
}

/// Get the log directory; proxycommand mode logs here since stdout is taken
pub fn log_dir() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("logs"))
}

/// Get the config file path
pub fn config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("config.json"))
}

/// Get the host key path
pub fn host_key_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("hostkey"))
}

/// Persistent bridge settings. Every field has a default so partial files
/// load fine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Credential profile; the SDK default chain when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,

    /// Broker region; the SDK default chain when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Relay helper executable
    pub helper_path: PathBuf,

    /// Arguments placed before the helper's own, e.g. for a wrapper
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub helper_args: Vec<String>,

    pub channel_accept_timeout_secs: u64,
    pub channel_accept_attempts: usize,

    /// Bytes per relayed read
    pub chunk_size: usize,

    pub port_offset: u16,
    pub port_tries: u16,

    /// Upper bound on helper startup (banner, handshake, listening line)
    pub startup_timeout_secs: u64,

    /// Fallback filter when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            profile: None,
            region: None,
            helper_path: PathBuf::from(DEFAULT_HELPER),
            helper_args: Vec::new(),
            channel_accept_timeout_secs: DEFAULT_ACCEPT_TIMEOUT.as_secs(),
            channel_accept_attempts: DEFAULT_ACCEPT_ATTEMPTS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            port_offset: DEFAULT_PORT_OFFSET,
            port_tries: DEFAULT_PORT_TRIES,
            startup_timeout_secs: 30,
            log_level: "info".to_string(),
        }
    }
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: config_file()?,
        })
    }

    /// Create storage manager with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Ensure the config directory exists
    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load configuration from disk
    /// Returns default config if file doesn't exist
    pub async fn load(&self) -> Result<BridgeConfig, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {:?}, using defaults", self.path);
                Ok(BridgeConfig::default())
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Save configuration to disk
    pub async fn save(&self, config: &BridgeConfig) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        // Write to temp file first, then rename (atomic write)
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    /// Check if config file exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Get config file path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("config.json"));

        let config = storage.load().await.unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert!(!storage.exists().await);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("nested").join("config.json"));

        let config = BridgeConfig {
            profile: Some("ops".into()),
            region: Some("eu-west-1".into()),
            port_tries: 5,
            ..Default::default()
        };
        storage.save(&config).await.unwrap();

        assert!(storage.exists().await);
        assert_eq!(storage.load().await.unwrap(), config);
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"region": "ap-south-1", "chunk_size": 4096}"#).unwrap();

        let config = ConfigStorage::with_path(path).load().await.unwrap();
        assert_eq!(config.region.as_deref(), Some("ap-south-1"));
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.helper_path, PathBuf::from("session-manager-plugin"));
        assert_eq!(config.port_offset, 3000);
        assert_eq!(config.channel_accept_timeout_secs, 10);
        assert_eq!(config.channel_accept_attempts, 3);
    }

    #[tokio::test]
    async fn test_corrupted_file_is_an_error() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = ConfigStorage::with_path(path).load().await.unwrap_err();
        assert!(matches!(err, StorageError::Json(_)));
    }

    #[test]
    fn test_default_serialization_omits_unset() {
        let json = serde_json::to_value(BridgeConfig::default()).unwrap();
        assert!(json.get("profile").is_none());
        assert!(json.get("helper_args").is_none());
        assert_eq!(json["startup_timeout_secs"], 30);
        assert_eq!(json["log_level"], "info");
    }
}
