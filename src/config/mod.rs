//! Configuration Management Module
//!
//! Handles the persisted bridge settings and the SSH host key.

pub mod host_key;
pub mod storage;

pub use host_key::{parse_private_key, HostKeyStore, HOST_KEY_BITS};
pub use storage::{
    config_dir, config_file, host_key_file, log_dir, BridgeConfig, ConfigStorage, StorageError,
};
