//! Volume operations bound to a single storage pool.

use crate::descriptor::VolumeSpec;
use crate::error::StorageResult;
use crate::ops::StorageOperations;
use crate::pool::{Pool, Volume, VolumeInfo, lookup_storage_pool};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use vmlet_common::PoolCatalog;

/// Capacity used when the caller does not specify one
pub const DEFAULT_CAPACITY: u64 = 1024;
pub const DEFAULT_CAPACITY_UNIT: &str = "MB";

/// Fixed size of volumes holding pulled images
pub const PULLED_IMAGE_CAPACITY: u64 = 5;
pub const PULLED_IMAGE_CAPACITY_UNIT: &str = "G";

/// Storage facade for one pool
pub struct StorageTool {
    pool: Pool,
}

impl StorageTool {
    /// Resolve (and if needed create) `pool_name` and bind to it.
    pub fn new(
        ops: Arc<dyn StorageOperations>,
        catalog: &PoolCatalog,
        pool_name: &str,
    ) -> StorageResult<Self> {
        let pool = lookup_storage_pool(ops, catalog, pool_name)?;
        Ok(Self { pool })
    }

    #[must_use]
    pub const fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Create an empty volume with zero allocation.
    pub fn create_volume(&self, name: &str, capacity: u64, unit: &str) -> StorageResult<Volume> {
        let descriptor = VolumeSpec::new(name, capacity, unit).to_xml()?;
        debug!("Create volume using descriptor: {}", descriptor);
        self.pool.create_volume(name, &descriptor)
    }

    /// Create a qcow2 volume layered on the image at `backing_store`.
    pub fn create_snapshot(
        &self,
        name: &str,
        capacity: u64,
        unit: &str,
        backing_store: &Path,
    ) -> StorageResult<Volume> {
        let descriptor = VolumeSpec::new(name, capacity, unit)
            .with_backing_store(backing_store)
            .to_xml()?;
        debug!("Create snapshot using descriptor: {}", descriptor);
        self.pool.create_volume(name, &descriptor)
    }

    pub fn lookup_volume(&self, name: &str) -> StorageResult<Volume> {
        self.pool.lookup_volume(name)
    }

    pub fn remove_volume(&self, name: &str) -> StorageResult<()> {
        self.pool.remove_volume(name)
    }

    pub fn list_volumes(&self) -> StorageResult<Vec<VolumeInfo>> {
        self.pool.list_volumes()
    }

    /// Copy the local image file `source` into a new volume named
    /// `volume_name` under the pool's root directory.
    pub fn pull_image_to_volume(&self, source: &Path, volume_name: &str) -> StorageResult<()> {
        let descriptor =
            VolumeSpec::new(volume_name, PULLED_IMAGE_CAPACITY, PULLED_IMAGE_CAPACITY_UNIT)
                .with_path(self.pool.path().join(volume_name))
                .to_xml()?;
        debug!(
            "Pulling {} into volume '{}' of pool '{}'",
            source.display(),
            volume_name,
            self.pool.name()
        );
        self.pool.ops().transfer_image_into_volume(
            self.pool.handle(),
            volume_name,
            source,
            &descriptor,
        )?;
        Ok(())
    }
}
