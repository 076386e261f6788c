//! In-memory storage backend.
//!
//! Behaves like a hypervisor that keeps pools and volumes in process
//! memory. Every call and every submitted descriptor is recorded, and a
//! failure can be queued for the next call of a given operation.

use crate::descriptor::{parse_pool, parse_volume};
use crate::error::{HypervisorError, HypervisorResult};
use crate::ops::{PoolHandle, StorageOperations, VolumeHandle, VolumeStats};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Capability operations, for call tracking and failure injection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    LookupPool,
    CreatePool,
    CreateVolume,
    LookupVolume,
    RemoveVolume,
    ListVolumes,
    VolumeInfo,
    VolumePath,
    VolumeName,
    TransferImage,
}

/// One recorded capability call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub op: Operation,
    /// Pool name, or `pool/volume` for volume operations
    pub target: String,
}

#[derive(Clone, Debug)]
struct MemoryVolume {
    path: PathBuf,
    capacity: u64,
    /// Image file the volume was filled from
    source: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct MemoryPool {
    path: PathBuf,
    volumes: BTreeMap<String, MemoryVolume>,
}

#[derive(Debug, Default)]
struct Inner {
    pools: BTreeMap<String, MemoryPool>,
    calls: Vec<Call>,
    descriptors: Vec<String>,
    failures: HashMap<Operation, HypervisorError>,
}

/// In-memory [`StorageOperations`] implementation
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create a pool as if it had been defined outside vmlet
    #[must_use]
    pub fn with_pool(self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.inner.lock().pools.insert(
            name.into(),
            MemoryPool {
                path: path.into(),
                volumes: BTreeMap::new(),
            },
        );
        self
    }

    /// Make the next call of `op` fail with `error`
    pub fn fail_next(&self, op: Operation, error: HypervisorError) {
        self.inner.lock().failures.insert(op, error);
    }

    /// Calls made so far, oldest first
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().calls.clone()
    }

    /// Number of calls of `op` made so far
    #[must_use]
    pub fn call_count(&self, op: Operation) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|call| call.op == op)
            .count()
    }

    /// Every pool and volume descriptor submitted, oldest first
    #[must_use]
    pub fn descriptors(&self) -> Vec<String> {
        self.inner.lock().descriptors.clone()
    }

    #[must_use]
    pub fn has_pool(&self, name: &str) -> bool {
        self.inner.lock().pools.contains_key(name)
    }

    /// Names of the volumes in `pool`, in name order
    #[must_use]
    pub fn volume_names(&self, pool: &str) -> Vec<String> {
        self.inner
            .lock()
            .pools
            .get(pool)
            .map(|p| p.volumes.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Image file a volume was filled from, if any
    #[must_use]
    pub fn volume_source(&self, pool: &str, volume: &str) -> Option<PathBuf> {
        self.inner
            .lock()
            .pools
            .get(pool)?
            .volumes
            .get(volume)?
            .source
            .clone()
    }
}

impl Inner {
    /// Record the call and consume any failure queued for it
    fn enter(&mut self, op: Operation, target: String) -> HypervisorResult<()> {
        self.calls.push(Call { op, target });
        self.failures.remove(&op).map_or(Ok(()), Err)
    }

    fn pool(&self, name: &str) -> HypervisorResult<&MemoryPool> {
        self.pools
            .get(name)
            .ok_or_else(|| HypervisorError::not_found(format!("no storage pool '{name}'")))
    }

    fn pool_mut(&mut self, name: &str) -> HypervisorResult<&mut MemoryPool> {
        self.pools
            .get_mut(name)
            .ok_or_else(|| HypervisorError::not_found(format!("no storage pool '{name}'")))
    }

    fn volume(&self, handle: &VolumeHandle) -> HypervisorResult<&MemoryVolume> {
        self.pool(handle.pool())?
            .volumes
            .get(handle.name())
            .ok_or_else(|| {
                HypervisorError::not_found(format!("no storage vol '{}'", handle.name()))
            })
    }

    fn create_volume(&mut self, pool: &str, descriptor: &str) -> HypervisorResult<VolumeHandle> {
        self.descriptors.push(descriptor.to_string());
        let parsed = parse_volume(descriptor)?;
        let capacity = parsed.capacity_bytes()?;
        let target_path = parsed.target_path().map(Path::to_path_buf);

        let pool_state = self.pool_mut(pool)?;
        if pool_state.volumes.contains_key(&parsed.name) {
            return Err(HypervisorError::already_exists(format!(
                "storage vol '{}' already exists",
                parsed.name
            )));
        }
        let path = target_path.unwrap_or_else(|| pool_state.path.join(&parsed.name));
        pool_state.volumes.insert(
            parsed.name.clone(),
            MemoryVolume {
                path,
                capacity,
                source: None,
            },
        );
        Ok(VolumeHandle::new(pool, parsed.name))
    }
}

fn volume_target(volume: &VolumeHandle) -> String {
    format!("{}/{}", volume.pool(), volume.name())
}

impl StorageOperations for MemoryStorage {
    fn lookup_pool_by_name(&self, name: &str) -> HypervisorResult<Option<PoolHandle>> {
        let mut inner = self.inner.lock();
        inner.enter(Operation::LookupPool, name.to_string())?;
        Ok(inner.pools.contains_key(name).then(|| PoolHandle::new(name)))
    }

    fn create_pool_from_descriptor(&self, descriptor: &str) -> HypervisorResult<PoolHandle> {
        let mut inner = self.inner.lock();
        let parsed = parse_pool(descriptor)?;
        inner.enter(Operation::CreatePool, parsed.name.clone())?;
        inner.descriptors.push(descriptor.to_string());

        if inner.pools.contains_key(&parsed.name) {
            return Err(HypervisorError::already_exists(format!(
                "pool '{}' already exists",
                parsed.name
            )));
        }
        let path = parsed
            .target
            .path
            .ok_or_else(|| HypervisorError::other("pool descriptor has no target path"))?;
        inner.pools.insert(
            parsed.name.clone(),
            MemoryPool {
                path,
                volumes: BTreeMap::new(),
            },
        );
        Ok(PoolHandle::new(parsed.name))
    }

    fn create_volume_from_descriptor(
        &self,
        pool: &PoolHandle,
        descriptor: &str,
    ) -> HypervisorResult<VolumeHandle> {
        let mut inner = self.inner.lock();
        inner.enter(Operation::CreateVolume, pool.name().to_string())?;
        inner.create_volume(pool.name(), descriptor)
    }

    fn lookup_volume_by_name(
        &self,
        pool: &PoolHandle,
        name: &str,
    ) -> HypervisorResult<VolumeHandle> {
        let mut inner = self.inner.lock();
        let handle = VolumeHandle::new(pool.name(), name);
        inner.enter(Operation::LookupVolume, volume_target(&handle))?;
        inner.volume(&handle)?;
        Ok(handle)
    }

    fn remove_volume(&self, volume: &VolumeHandle) -> HypervisorResult<()> {
        let mut inner = self.inner.lock();
        inner.enter(Operation::RemoveVolume, volume_target(volume))?;
        inner
            .pool_mut(volume.pool())?
            .volumes
            .remove(volume.name())
            .map(|_| ())
            .ok_or_else(|| {
                HypervisorError::not_found(format!("no storage vol '{}'", volume.name()))
            })
    }

    fn list_all_volumes(&self, pool: &PoolHandle) -> HypervisorResult<Vec<VolumeHandle>> {
        let mut inner = self.inner.lock();
        inner.enter(Operation::ListVolumes, pool.name().to_string())?;
        Ok(inner
            .pool(pool.name())?
            .volumes
            .keys()
            .map(|name| VolumeHandle::new(pool.name(), name.as_str()))
            .collect())
    }

    fn volume_info(&self, volume: &VolumeHandle) -> HypervisorResult<VolumeStats> {
        let mut inner = self.inner.lock();
        inner.enter(Operation::VolumeInfo, volume_target(volume))?;
        let stored = inner.volume(volume)?;
        Ok(VolumeStats {
            capacity: stored.capacity,
            allocation: 0,
        })
    }

    fn volume_path(&self, volume: &VolumeHandle) -> HypervisorResult<PathBuf> {
        let mut inner = self.inner.lock();
        inner.enter(Operation::VolumePath, volume_target(volume))?;
        Ok(inner.volume(volume)?.path.clone())
    }

    fn volume_name(&self, volume: &VolumeHandle) -> HypervisorResult<String> {
        let mut inner = self.inner.lock();
        inner.enter(Operation::VolumeName, volume_target(volume))?;
        inner.volume(volume)?;
        Ok(volume.name().to_string())
    }

    fn transfer_image_into_volume(
        &self,
        pool: &PoolHandle,
        volume_name: &str,
        source: &Path,
        descriptor: &str,
    ) -> HypervisorResult<()> {
        let mut inner = self.inner.lock();
        inner.enter(
            Operation::TransferImage,
            format!("{}/{}", pool.name(), volume_name),
        )?;
        let handle = inner.create_volume(pool.name(), descriptor)?;
        if let Some(volume) = inner
            .pools
            .get_mut(handle.pool())
            .and_then(|p| p.volumes.get_mut(handle.name()))
        {
            volume.source = Some(source.to_path_buf());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::VolumeSpec;

    #[test]
    fn test_volume_lifecycle() {
        let storage = MemoryStorage::new().with_pool("default", "/images");
        let pool = storage.lookup_pool_by_name("default").unwrap().unwrap();

        let xml = VolumeSpec::new("disk", 1, "G").to_xml().unwrap();
        let volume = storage.create_volume_from_descriptor(&pool, &xml).unwrap();
        assert_eq!(
            storage.volume_path(&volume).unwrap(),
            PathBuf::from("/images/disk")
        );
        assert_eq!(storage.volume_info(&volume).unwrap().capacity, 1 << 30);

        let err = storage
            .create_volume_from_descriptor(&pool, &xml)
            .unwrap_err();
        assert_eq!(err.kind, crate::HypervisorErrorKind::AlreadyExists);

        storage.remove_volume(&volume).unwrap();
        assert!(storage.lookup_volume_by_name(&pool, "disk").unwrap_err().is_not_found());
        assert_eq!(storage.descriptors(), vec![xml.clone(), xml]);
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let storage = MemoryStorage::new().with_pool("default", "/images");
        storage.fail_next(Operation::LookupPool, HypervisorError::other("boom"));

        assert!(storage.lookup_pool_by_name("default").is_err());
        assert!(storage.lookup_pool_by_name("default").unwrap().is_some());
        assert_eq!(storage.call_count(Operation::LookupPool), 2);
    }

    #[test]
    fn test_missing_pool_lookup() {
        let storage = MemoryStorage::new();
        assert!(storage.lookup_pool_by_name("default").unwrap().is_none());
        assert_eq!(
            storage.calls(),
            vec![Call {
                op: Operation::LookupPool,
                target: "default".into()
            }]
        );
    }
}
