//! vmlet Storage - libvirt storage pools and volumes
//!
//! This crate maps named storage pools from the node configuration onto
//! hypervisor pools and manages the disk volumes inside them: plain
//! volumes, qcow2 snapshots of base images, and volumes filled from
//! pulled image files. All hypervisor calls go through the
//! [`StorageOperations`] trait, implemented by [`VirshStorage`] for real
//! hosts and [`MemoryStorage`] for tests.

pub mod descriptor;
pub mod error;
pub mod memory;
pub mod ops;
pub mod pool;
pub mod tool;
pub mod virsh;

// Re-exports
pub use descriptor::{VolumeSpec, capacity_in_bytes, pool_descriptor};
pub use error::{HypervisorError, HypervisorErrorKind, HypervisorResult, StorageError, StorageResult};
pub use memory::MemoryStorage;
pub use ops::{PoolHandle, StorageOperations, VolumeHandle, VolumeStats};
pub use pool::{Pool, Volume, VolumeInfo, lookup_storage_pool};
pub use tool::StorageTool;
pub use virsh::VirshStorage;
