//! Configuration for a quota node

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name this node's party is registered under
    pub party_name: String,

    /// Name of the notary party
    pub notary_name: String,

    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Keep the vault and flow checkpoints in RocksDB instead of memory
    pub persistent: bool,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Flow configuration
    pub flow: FlowConfig,

    /// Session network configuration
    pub network: NetworkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            party_name: "Mill".to_string(),
            notary_name: "Notary".to_string(),
            data_dir: PathBuf::from("./data/quota"),
            persistent: false,
            rocksdb: RocksDBConfig::default(),
            flow: FlowConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Flow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// How long to wait for a counterparty signature (milliseconds)
    pub session_timeout_ms: u64,

    /// How long to wait for the notary (milliseconds)
    pub finality_timeout_ms: u64,

    /// Write initiator checkpoints on every transition
    pub checkpoints_enabled: bool,

    /// Capacity of the flow event broadcast channel
    pub event_capacity: usize,

    /// Counterparty flows kept for status queries; oldest evicted first
    pub counterparty_retention: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: 5_000,
            finality_timeout_ms: 10_000,
            checkpoints_enabled: true,
            event_capacity: 256,
            counterparty_retention: 1024,
        }
    }
}

/// Session network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Bounded mailbox size per party (backpressure)
    pub mailbox_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse TOML text
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(name) = std::env::var("QUOTA_PARTY_NAME") {
            config.party_name = name;
        }

        if let Ok(name) = std::env::var("QUOTA_NOTARY_NAME") {
            config.notary_name = name;
        }

        if let Ok(data_dir) = std::env::var("QUOTA_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(persistent) = std::env::var("QUOTA_PERSISTENT") {
            config.persistent = persistent.parse().map_err(|_| {
                crate::Error::Config(format!(
                    "QUOTA_PERSISTENT must be true or false, got {}",
                    persistent
                ))
            })?;
        }

        if let Ok(timeout) = std::env::var("QUOTA_SESSION_TIMEOUT_MS") {
            config.flow.session_timeout_ms = timeout.parse().map_err(|_| {
                crate::Error::Config(format!("Invalid QUOTA_SESSION_TIMEOUT_MS: {}", timeout))
            })?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.notary_name, "Notary");
        assert!(!config.persistent);
        assert!(config.flow.checkpoints_enabled);
        assert_eq!(config.flow.counterparty_retention, 1024);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml(
            r#"
            party_name = "NorthMill"
            persistent = true

            [flow]
            session_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.party_name, "NorthMill");
        assert!(config.persistent);
        assert_eq!(config.flow.session_timeout_ms, 250);
        assert_eq!(config.flow.finality_timeout_ms, 10_000);
        assert_eq!(config.network.mailbox_capacity, 1000);
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            Config::from_toml("persistent = \"maybe\""),
            Err(crate::Error::Config(_))
        ));
    }
}
