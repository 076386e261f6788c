//! Configuration types for vmlet
//!
//! The node configuration is read from a TOML file. Every field has a
//! default so a missing file or a partial file is valid; binaries layer
//! command-line overrides on top of the loaded values.

use crate::error::{Error, Result};
use crate::pool::PoolCatalog;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for vmlet
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Metadata store configuration
    pub store: StoreConfig,
    /// Hypervisor storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| Error::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| Error::ParseConfig {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.store.batch.max_size == 0 {
            return Err(Error::configuration("store.batch.max_size must be positive"));
        }
        if self.storage.pools.is_empty() {
            return Err(Error::configuration("storage.pools must define at least one pool"));
        }
        for (name, spec) in self.storage.pools.iter() {
            if name.is_empty() {
                return Err(Error::configuration("storage pool names must not be empty"));
            }
            if !spec.path.is_absolute() {
                return Err(Error::configuration(format!(
                    "storage pool '{}' has a relative path {}",
                    name,
                    spec.path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Metadata store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the redb database file
    pub path: PathBuf,
    /// Batched commit tuning
    pub batch: BatchConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/vmlet/vmlet.redb"),
            batch: BatchConfig::default(),
        }
    }
}

/// Batched commit tuning for coalesced writers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum number of calls folded into one write transaction
    pub max_size: usize,
    /// How long the first caller waits for others to join (milliseconds)
    pub max_delay_ms: u64,
}

impl BatchConfig {
    /// Batch window as a duration
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_delay_ms: 10,
        }
    }
}

/// Hypervisor storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// libvirt connection URI
    pub connect_uri: String,
    /// Path to the virsh binary
    pub virsh_binary: PathBuf,
    /// Pools that may be created and used on this node
    pub pools: PoolCatalog,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            connect_uri: "qemu:///system".to_string(),
            virsh_binary: PathBuf::from("virsh"),
            pools: PoolCatalog::default(),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level filter, overridden by `RUST_LOG`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
