//! Storage pools and the volumes inside them.

use crate::descriptor::pool_descriptor;
use crate::error::{StorageError, StorageResult};
use crate::ops::{PoolHandle, StorageOperations, VolumeHandle};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use vmlet_common::PoolCatalog;

/// Name and size of a volume
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VolumeInfo {
    pub name: String,
    /// Capacity in bytes
    pub size: u64,
}

fn volume_info(
    ops: &dyn StorageOperations,
    name: String,
    handle: &VolumeHandle,
) -> StorageResult<VolumeInfo> {
    let stats = ops.volume_info(handle)?;
    Ok(VolumeInfo {
        name,
        size: stats.capacity,
    })
}

/// A volume inside a pool
pub struct Volume {
    ops: Arc<dyn StorageOperations>,
    name: String,
    handle: VolumeHandle,
}

impl Volume {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remove(&self) -> StorageResult<()> {
        self.ops.remove_volume(&self.handle)?;
        debug!("Removed volume '{}'", self.name);
        Ok(())
    }

    /// Host path of the volume's backing file
    pub fn path(&self) -> StorageResult<PathBuf> {
        Ok(self.ops.volume_path(&self.handle)?)
    }

    pub fn info(&self) -> StorageResult<VolumeInfo> {
        volume_info(self.ops.as_ref(), self.name.clone(), &self.handle)
    }
}

/// A catalog pool that exists on the hypervisor
pub struct Pool {
    ops: Arc<dyn StorageOperations>,
    handle: PoolHandle,
    path: PathBuf,
}

/// Resolve `name` against the catalog, creating the pool on the hypervisor
/// if it is not defined there yet.
///
/// Names missing from the catalog are rejected before any hypervisor call.
pub fn lookup_storage_pool(
    ops: Arc<dyn StorageOperations>,
    catalog: &PoolCatalog,
    name: &str,
) -> StorageResult<Pool> {
    let spec = catalog
        .get(name)
        .ok_or_else(|| StorageError::UnknownPool(name.to_string()))?;

    let handle = if let Some(handle) = ops.lookup_pool_by_name(name)? {
        handle
    } else {
        info!(
            "Creating storage pool (name: {}, path: {})",
            name,
            spec.path.display()
        );
        let descriptor = pool_descriptor(name, spec)?;
        ops.create_pool_from_descriptor(&descriptor)?
    };

    Ok(Pool {
        ops,
        handle,
        path: spec.path.clone(),
    })
}

impl Pool {
    #[must_use]
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Root directory of the pool on the host
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) const fn handle(&self) -> &PoolHandle {
        &self.handle
    }

    pub(crate) fn ops(&self) -> &Arc<dyn StorageOperations> {
        &self.ops
    }

    fn volume(&self, name: &str, handle: VolumeHandle) -> Volume {
        Volume {
            ops: Arc::clone(&self.ops),
            name: name.to_string(),
            handle,
        }
    }

    pub fn create_volume(&self, name: &str, descriptor: &str) -> StorageResult<Volume> {
        let handle = self
            .ops
            .create_volume_from_descriptor(&self.handle, descriptor)?;
        Ok(self.volume(name, handle))
    }

    pub fn lookup_volume(&self, name: &str) -> StorageResult<Volume> {
        let handle = self.ops.lookup_volume_by_name(&self.handle, name)?;
        Ok(self.volume(name, handle))
    }

    pub fn remove_volume(&self, name: &str) -> StorageResult<()> {
        self.lookup_volume(name)?.remove()
    }

    /// Name and size of every volume in the pool. Fails as a whole if any
    /// volume cannot be inspected.
    pub fn list_volumes(&self) -> StorageResult<Vec<VolumeInfo>> {
        let handles = self.ops.list_all_volumes(&self.handle)?;
        handles
            .iter()
            .map(|handle| {
                let name = self.ops.volume_name(handle)?;
                volume_info(self.ops.as_ref(), name, handle)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::VolumeSpec;
    use crate::error::HypervisorError;
    use crate::memory::{MemoryStorage, Operation};
    use vmlet_common::PoolSpec;

    fn catalog() -> PoolCatalog {
        PoolCatalog::empty().with_pool("default", PoolSpec::dir("/images"))
    }

    #[test]
    fn test_unknown_pool_makes_no_hypervisor_call() {
        let storage = Arc::new(MemoryStorage::new());
        let result = lookup_storage_pool(storage.clone(), &catalog(), "nope");

        assert!(matches!(result, Err(StorageError::UnknownPool(ref name)) if name == "nope"));
        assert!(storage.calls().is_empty());
    }

    #[test]
    fn test_lookup_creates_missing_pool_once() {
        let storage = Arc::new(MemoryStorage::new());

        let pool = lookup_storage_pool(storage.clone(), &catalog(), "default").unwrap();
        assert_eq!(pool.name(), "default");
        assert_eq!(pool.path(), Path::new("/images"));
        assert_eq!(storage.call_count(Operation::CreatePool), 1);
        assert!(storage.has_pool("default"));

        let again = lookup_storage_pool(storage.clone(), &catalog(), "default").unwrap();
        assert_eq!(again.name(), "default");
        assert_eq!(storage.call_count(Operation::CreatePool), 1);
        assert_eq!(storage.call_count(Operation::LookupPool), 2);

        let descriptor = &storage.descriptors()[0];
        assert!(descriptor.contains(r#"<pool type="dir">"#));
        assert!(descriptor.contains("<path>/images</path>"));
    }

    #[test]
    fn test_lookup_uses_existing_pool() {
        let storage = Arc::new(MemoryStorage::new().with_pool("default", "/images"));
        lookup_storage_pool(storage.clone(), &catalog(), "default").unwrap();
        assert_eq!(storage.call_count(Operation::CreatePool), 0);
    }

    #[test]
    fn test_lookup_propagates_hypervisor_error() {
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_next(Operation::LookupPool, HypervisorError::other("connection reset"));

        let Err(err) = lookup_storage_pool(storage.clone(), &catalog(), "default") else {
            panic!("lookup should fail");
        };
        assert!(matches!(err, StorageError::Hypervisor(_)));
        assert_eq!(storage.call_count(Operation::CreatePool), 0);
    }

    #[test]
    fn test_volume_operations() {
        let storage = Arc::new(MemoryStorage::new());
        let pool = lookup_storage_pool(storage.clone(), &catalog(), "default").unwrap();

        let xml = VolumeSpec::new("disk", 2, "M").to_xml().unwrap();
        let volume = pool.create_volume("disk", &xml).unwrap();
        assert_eq!(volume.name(), "disk");
        assert_eq!(volume.path().unwrap(), PathBuf::from("/images/disk"));
        assert_eq!(
            volume.info().unwrap(),
            VolumeInfo {
                name: "disk".into(),
                size: 2 << 20
            }
        );

        pool.remove_volume("disk").unwrap();
        assert!(pool.lookup_volume("disk").err().unwrap().is_not_found());
        assert!(pool.remove_volume("disk").unwrap_err().is_not_found());
    }

    #[test]
    fn test_list_volumes_has_no_partial_results() {
        let storage = Arc::new(MemoryStorage::new());
        let pool = lookup_storage_pool(storage.clone(), &catalog(), "default").unwrap();
        for name in ["a", "b"] {
            let xml = VolumeSpec::new(name, 1, "K").to_xml().unwrap();
            pool.create_volume(name, &xml).unwrap();
        }

        let listed = pool.list_volumes().unwrap();
        assert_eq!(
            listed,
            vec![
                VolumeInfo {
                    name: "a".into(),
                    size: 1024
                },
                VolumeInfo {
                    name: "b".into(),
                    size: 1024
                },
            ]
        );

        storage.fail_next(Operation::VolumeName, HypervisorError::other("lost"));
        assert!(pool.list_volumes().is_err());
        storage.fail_next(Operation::VolumeInfo, HypervisorError::other("lost"));
        assert!(pool.list_volumes().is_err());
    }
}
