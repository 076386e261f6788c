//! vmlet Common - Shared configuration and error types
//!
//! This crate holds the node configuration (metadata store location,
//! libvirt connection, storage pool catalog) used by every other vmlet
//! component.

pub mod config;
pub mod error;
pub mod pool;

pub use config::{BatchConfig, Config, LoggingConfig, StorageConfig, StoreConfig};
pub use error::{Error, Result};
pub use pool::{PoolCatalog, PoolKind, PoolSpec};
