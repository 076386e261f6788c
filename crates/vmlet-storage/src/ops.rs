//! Storage capability interface.
//!
//! Every hypervisor storage call goes through [`StorageOperations`], so the
//! pool and volume manager can run against libvirt or an in-memory fake.

use crate::error::HypervisorResult;
use std::path::{Path, PathBuf};

/// Opaque reference to a hypervisor storage pool
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolHandle {
    name: String,
}

impl PoolHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Opaque reference to a volume inside a pool
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VolumeHandle {
    pool: String,
    name: String,
}

impl VolumeHandle {
    pub fn new(pool: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            name: name.into(),
        }
    }

    #[must_use]
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Name the handle was created with. Use
    /// [`StorageOperations::volume_name`] for the hypervisor's view.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Size information reported for a volume
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VolumeStats {
    /// Logical size in bytes
    pub capacity: u64,
    /// Bytes actually allocated on the host
    pub allocation: u64,
}

/// Hypervisor storage API
pub trait StorageOperations: Send + Sync {
    /// Find a pool by name. `Ok(None)` means the hypervisor has no such pool.
    fn lookup_pool_by_name(&self, name: &str) -> HypervisorResult<Option<PoolHandle>>;

    /// Create and start a pool from a pool descriptor
    fn create_pool_from_descriptor(&self, descriptor: &str) -> HypervisorResult<PoolHandle>;

    fn create_volume_from_descriptor(
        &self,
        pool: &PoolHandle,
        descriptor: &str,
    ) -> HypervisorResult<VolumeHandle>;

    fn lookup_volume_by_name(&self, pool: &PoolHandle, name: &str)
    -> HypervisorResult<VolumeHandle>;

    fn remove_volume(&self, volume: &VolumeHandle) -> HypervisorResult<()>;

    fn list_all_volumes(&self, pool: &PoolHandle) -> HypervisorResult<Vec<VolumeHandle>>;

    fn volume_info(&self, volume: &VolumeHandle) -> HypervisorResult<VolumeStats>;

    fn volume_path(&self, volume: &VolumeHandle) -> HypervisorResult<PathBuf>;

    fn volume_name(&self, volume: &VolumeHandle) -> HypervisorResult<String>;

    /// Create a volume from `descriptor` and fill it with the contents of
    /// the local file `source`.
    fn transfer_image_into_volume(
        &self,
        pool: &PoolHandle,
        volume_name: &str,
        source: &Path,
        descriptor: &str,
    ) -> HypervisorResult<()>;
}
