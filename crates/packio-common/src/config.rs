//! Configuration types for PackIO
//!
//! This module defines configuration structures used across components.
//! Engine tunables live in [`EngineConfig`] and are handed to constructors;
//! nothing in the engine reads process-wide settings.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for a PackIO node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node configuration
    pub node: NodeConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Network configuration
    pub network: NetworkConfig,
    /// Storage engine tunables
    pub engine: EngineConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Node identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name (human-readable identifier)
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "packio-node".to_string(),
        }
    }
}

/// Device and policy configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one mount point per device
    pub devices_root: PathBuf,
    /// Device names under `devices_root`
    pub devices: Vec<String>,
    /// Storage policies served by every device
    pub policies: Vec<u32>,
    /// Refuse device roots that are missing instead of creating them
    pub mount_check: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            devices_root: PathBuf::from("/srv/node"),
            devices: Vec::new(),
            policies: vec![0],
            mount_check: true,
        }
    }
}

/// Network configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address for the replication/audit gRPC service
    pub rpc_listen: SocketAddr,
    /// Address for the metrics endpoint
    pub metrics_listen: SocketAddr,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rpc_listen: SocketAddr::from(([0, 0, 0, 0], 60000)),
            metrics_listen: SocketAddr::from(([0, 0, 0, 0], 9210)),
        }
    }
}

/// Storage engine tunables
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Objects at or above this size bypass the pack file (default: 32 KiB)
    pub needle_threshold: u64,
    /// Maximum bytes per metadata attribute slot (default: 64 KiB)
    pub metadata_chunk_size: usize,
    /// Age after which a lone tombstone is reclaimed (default: one week)
    pub reclaim_age_secs: u64,
    /// Bound on waiting for a partition lock (default: 10 s)
    pub lock_timeout_ms: u64,
    /// Flush to stable storage on commit
    pub fsync: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            needle_threshold: 32 * 1024,
            metadata_chunk_size: 65536,
            reclaim_age_secs: 7 * 24 * 60 * 60,
            lock_timeout_ms: 10_000,
            fsync: true,
        }
    }
}

impl EngineConfig {
    /// Reclaim age as a duration
    #[must_use]
    pub const fn reclaim_age(&self) -> Duration {
        Duration::from_secs(self.reclaim_age_secs)
    }

    /// Partition lock timeout as a duration
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Whether an object of the given size is packed as a needle
    #[must_use]
    pub const fn is_needle(&self, size: u64) -> bool {
        size < self.needle_threshold
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.name, "packio-node");
        assert_eq!(config.storage.policies, vec![0]);
        assert_eq!(config.network.rpc_listen.port(), 60000);
        assert_eq!(config.engine.metadata_chunk_size, 65536);
        assert_eq!(config.engine.reclaim_age(), Duration::from_secs(604_800));
    }

    #[test]
    fn test_needle_threshold_boundary() {
        let engine = EngineConfig::default();
        assert!(engine.is_needle(0));
        assert!(engine.is_needle(engine.needle_threshold - 1));
        assert!(!engine.is_needle(engine.needle_threshold));
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            devices_root = "/mnt/packio"
            devices = ["sda", "sdb"]

            [engine]
            needle_threshold = 4096
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.devices, vec!["sda", "sdb"]);
        assert_eq!(config.storage.policies, vec![0]);
        assert!(config.storage.mount_check);
        assert_eq!(config.engine.needle_threshold, 4096);
        assert_eq!(config.engine.lock_timeout(), Duration::from_secs(10));
    }
}
