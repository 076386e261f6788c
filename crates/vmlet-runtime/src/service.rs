//! CRI verbs over the metadata store and the image pool.
//!
//! The store and the hypervisor share no transaction. Volumes are created
//! before any metadata names them and are removed only after the metadata
//! is gone, so a crash can leave an unused volume behind but never a
//! container record pointing at a missing disk.

use crate::error::{RuntimeError, RuntimeResult};
use crate::sandbox::SandboxService;
use std::collections::HashMap;
use std::path::Path;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vmlet_meta_store::{
    Clock, ContainerInfo, ContainerSpec, ContainerState, MetaStore, MetaStoreError,
    PodSandboxConfig,
};
use vmlet_storage::StorageTool;

/// Unit passed to the hypervisor when sizing snapshots from a base image
const BYTES: &str = "bytes";

/// Container parameters supplied by the CRI client
#[derive(Clone, Debug, Default)]
pub struct ContainerConfig {
    pub name: String,
    /// Image reference; must have been imported first
    pub image: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub attempt: u32,
}

/// Volume name an image is stored under in the image pool
///
/// Every character outside `[A-Za-z0-9._-]` becomes `_`, and the first
/// four bytes of the reference's SHA-256 are appended in hex so distinct
/// references never share a volume.
pub fn image_volume_name(image: &str) -> RuntimeResult<String> {
    let sanitized: String = image
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        return Err(RuntimeError::InvalidImage(image.to_string()));
    }
    let digest = Sha256::digest(image.as_bytes());
    Ok(format!("{sanitized}-{}", hex::encode(&digest[..4])))
}

/// Name of a container's root volume
#[must_use]
pub fn root_volume_name(container_id: &str) -> String {
    format!("{container_id}-root")
}

pub struct RuntimeService {
    store: Arc<MetaStore>,
    sandboxes: SandboxService,
    images: StorageTool,
    clock: Arc<dyn Clock>,
}

impl RuntimeService {
    /// `images` must be bound to the pool holding base images and root
    /// volumes.
    pub fn new(store: Arc<MetaStore>, images: StorageTool, clock: Arc<dyn Clock>) -> Self {
        Self {
            sandboxes: SandboxService::new(Arc::clone(&store)),
            store,
            images,
            clock,
        }
    }

    #[must_use]
    pub fn store(&self) -> &MetaStore {
        &self.store
    }

    fn now_nanos(&self) -> RuntimeResult<i64> {
        self.clock
            .now()
            .timestamp_nanos_opt()
            .ok_or(RuntimeError::MetaStore(MetaStoreError::ClockOutOfRange))
    }

    pub fn run_pod_sandbox(&self, config: &PodSandboxConfig) -> RuntimeResult<String> {
        self.sandboxes.run_pod_sandbox(config)
    }

    pub fn remove_pod_sandbox(&self, sandbox_id: &str) -> RuntimeResult<()> {
        self.sandboxes.remove_pod_sandbox(sandbox_id)
    }

    /// Copy a local image file into the image pool. Returns the volume name.
    pub fn import_image(&self, image: &str, source: &Path) -> RuntimeResult<String> {
        let volume_name = image_volume_name(image)?;
        self.images.pull_image_to_volume(source, &volume_name)?;
        info!("Imported image {} as volume '{}'", image, volume_name);
        Ok(volume_name)
    }

    /// Create a container with a copy-on-write root disk over its image.
    pub fn create_container(
        &self,
        sandbox_id: &str,
        config: &ContainerConfig,
    ) -> RuntimeResult<String> {
        if self.store.get_pod_sandbox(sandbox_id)?.is_none() {
            return Err(MetaStoreError::SandboxNotFound(sandbox_id.to_string()).into());
        }

        let base = self.images.lookup_volume(&image_volume_name(&config.image)?)?;
        let base_size = base.info()?.size;
        let base_path = base.path()?;

        let container_id = Uuid::new_v4().to_string();
        let root_volume = root_volume_name(&container_id);
        let volume = self
            .images
            .create_snapshot(&root_volume, base_size, BYTES, &base_path)?;

        let spec = ContainerSpec {
            name: config.name.clone(),
            sandbox_id: sandbox_id.to_string(),
            image: config.image.clone(),
            root_image_volume_name: root_volume.clone(),
            labels: config.labels.clone(),
            annotations: config.annotations.clone(),
            attempt: config.attempt,
        };
        if let Err(e) = self.store.set_container(&container_id, &spec) {
            if let Err(cleanup) = volume.remove() {
                warn!(
                    "Failed to remove volume '{}' after failed container create: {}",
                    root_volume, cleanup
                );
            }
            return Err(e.into());
        }

        info!(
            "Created container {} ({}) in sandbox {}",
            container_id, config.name, sandbox_id
        );
        Ok(container_id)
    }

    fn require_container(&self, container_id: &str) -> RuntimeResult<ContainerInfo> {
        self.store
            .get_container_info(container_id)?
            .ok_or_else(|| RuntimeError::ContainerNotFound(container_id.to_string()))
    }

    pub fn start_container(&self, container_id: &str) -> RuntimeResult<()> {
        self.require_container(container_id)?;
        self.store
            .update_state(container_id, ContainerState::Running)?;
        self.store
            .update_started_at(container_id, self.now_nanos()?)?;
        info!("Started container {}", container_id);
        Ok(())
    }

    pub fn stop_container(&self, container_id: &str) -> RuntimeResult<()> {
        self.require_container(container_id)?;
        self.store
            .update_state(container_id, ContainerState::Exited)?;
        info!("Stopped container {}", container_id);
        Ok(())
    }

    pub fn container_status(&self, container_id: &str) -> RuntimeResult<Option<ContainerInfo>> {
        Ok(self.store.get_container_info(container_id)?)
    }

    /// Remove container metadata, then its root volume.
    ///
    /// Removing an unknown container succeeds. If the volume cannot be
    /// removed the metadata stays removed and the volume is reported in
    /// [`RuntimeError::OrphanedVolume`].
    pub fn remove_container(&self, container_id: &str) -> RuntimeResult<()> {
        let Some(info) = self.store.get_container_info(container_id)? else {
            debug!("Container {} already removed", container_id);
            return Ok(());
        };

        match self.store.remove_container(container_id) {
            Ok(()) => {}
            Err(MetaStoreError::ContainerNotFound(_)) => {
                // A concurrent removal won; it also owns the volume
                debug!("Container {} removed concurrently", container_id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        match self.images.remove_volume(&info.root_image_volume_name) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(
                    "Root volume '{}' of container {} was already gone",
                    info.root_image_volume_name, container_id
                );
            }
            Err(e) => {
                return Err(RuntimeError::OrphanedVolume {
                    container_id: container_id.to_string(),
                    volume: info.root_image_volume_name,
                    source: e,
                });
            }
        }

        info!("Removed container {}", container_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use std::sync::Barrier;
    use tempfile::TempDir;
    use vmlet_common::PoolCatalog;
    use vmlet_common::pool::DEFAULT_POOL;
    use vmlet_meta_store::{FakeClock, MetaStoreOptions};
    use vmlet_storage::memory::{MemoryStorage, Operation};
    use vmlet_storage::{HypervisorError, StorageError};

    const IMAGE: &str = "docker.io/library/cirros:latest";
    const IMAGE_VOLUME: &str = "docker.io_library_cirros_latest-c3be4df0";

    struct Fixture {
        _dir: TempDir,
        storage: Arc<MemoryStorage>,
        clock: Arc<FakeClock>,
        runtime: RuntimeService,
    }

    fn fixture(with_container_schema: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(FakeClock::new(
            DateTime::from_timestamp(1_500_000_000, 0).unwrap(),
        ));
        let store = MetaStore::open_with(
            dir.path().join("vmlet.redb"),
            MetaStoreOptions {
                clock: clock.clone(),
                ..Default::default()
            },
        )
        .unwrap();
        store.ensure_sandbox_schema().unwrap();
        if with_container_schema {
            store.ensure_schema().unwrap();
        }

        let storage = Arc::new(MemoryStorage::new());
        let images = StorageTool::new(storage.clone(), &PoolCatalog::default(), DEFAULT_POOL).unwrap();
        let runtime = RuntimeService::new(Arc::new(store), images, clock.clone());
        Fixture {
            _dir: dir,
            storage,
            clock,
            runtime,
        }
    }

    fn container_config() -> ContainerConfig {
        ContainerConfig {
            name: "vm".into(),
            image: IMAGE.into(),
            ..Default::default()
        }
    }

    /// Sandbox plus imported image
    fn prepared(f: &Fixture) -> String {
        f.runtime
            .import_image(IMAGE, Path::new("/tmp/cirros.img"))
            .unwrap();
        f.runtime
            .run_pod_sandbox(&PodSandboxConfig {
                name: "pod".into(),
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn test_image_volume_name() {
        assert_eq!(image_volume_name(IMAGE).unwrap(), IMAGE_VOLUME);
        assert_eq!(
            image_volume_name("fedora-26.qcow2").unwrap(),
            "fedora-26.qcow2-7b4bbf1d"
        );
        assert!(image_volume_name("").is_err());
        assert!(image_volume_name("..").is_err());
    }

    #[test]
    fn test_similar_references_get_distinct_volumes() {
        assert_eq!(
            image_volume_name("library/cirros").unwrap(),
            "library_cirros-0ac6e51e"
        );
        assert_eq!(
            image_volume_name("library:cirros").unwrap(),
            "library_cirros-cdea2c43"
        );

        let f = fixture(true);
        f.runtime
            .import_image("library/cirros", Path::new("/tmp/cirros.img"))
            .unwrap();
        let sandbox_id = f
            .runtime
            .run_pod_sandbox(&PodSandboxConfig::default())
            .unwrap();

        let config = ContainerConfig {
            name: "vm".into(),
            image: "library:cirros".into(),
            ..Default::default()
        };
        let err = f.runtime.create_container(&sandbox_id, &config).unwrap_err();
        assert!(matches!(err, RuntimeError::Storage(ref e) if e.is_not_found()));
        assert_eq!(f.storage.call_count(Operation::CreateVolume), 0);
    }

    #[test]
    fn test_create_container_snapshots_image() {
        let f = fixture(true);
        let sandbox_id = prepared(&f);

        let container_id = f
            .runtime
            .create_container(&sandbox_id, &container_config())
            .unwrap();

        let info = f.runtime.container_status(&container_id).unwrap().unwrap();
        assert_eq!(info.root_image_volume_name, format!("{container_id}-root"));
        assert_eq!(info.state, ContainerState::Created);
        assert_eq!(
            f.runtime.store().get_pod_sandbox(&sandbox_id).unwrap().unwrap().container_id,
            container_id
        );

        let snapshot = f.storage.descriptors().pop().unwrap();
        assert!(snapshot.contains(
            &format!("<path>/var/lib/libvirt/images/{IMAGE_VOLUME}</path>")
        ));
        assert!(snapshot.contains(&format!(r#"<capacity unit="bytes">{}</capacity>"#, 5u64 << 30)));
        assert!(f
            .storage
            .volume_names(DEFAULT_POOL)
            .contains(&info.root_image_volume_name));
    }

    #[test]
    fn test_create_container_unknown_sandbox_touches_no_volume() {
        let f = fixture(true);
        prepared(&f);

        let err = f
            .runtime
            .create_container("missing", &container_config())
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(f.storage.call_count(Operation::CreateVolume), 0);
    }

    #[test]
    fn test_create_container_without_image_fails() {
        let f = fixture(true);
        let sandbox_id = f
            .runtime
            .run_pod_sandbox(&PodSandboxConfig::default())
            .unwrap();

        let err = f
            .runtime
            .create_container(&sandbox_id, &container_config())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Storage(ref e) if e.is_not_found()));
    }

    #[test]
    fn test_failed_metadata_write_removes_new_volume() {
        let f = fixture(false);
        let sandbox_id = prepared(&f);

        let err = f
            .runtime
            .create_container(&sandbox_id, &container_config())
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::MetaStore(MetaStoreError::SchemaMissing(_))
        ));
        assert_eq!(f.storage.call_count(Operation::CreateVolume), 1);
        assert_eq!(f.storage.call_count(Operation::RemoveVolume), 1);
        assert_eq!(
            f.storage.volume_names(DEFAULT_POOL),
            [IMAGE_VOLUME]
        );
    }

    #[test]
    fn test_start_and_stop() {
        let f = fixture(true);
        let sandbox_id = prepared(&f);
        let container_id = f
            .runtime
            .create_container(&sandbox_id, &container_config())
            .unwrap();

        f.clock.advance(chrono::Duration::seconds(3));
        f.runtime.start_container(&container_id).unwrap();
        let info = f.runtime.container_status(&container_id).unwrap().unwrap();
        assert_eq!(info.state, ContainerState::Running);
        assert_eq!(info.started_at, Some(1_500_000_003 * 1_000_000_000));

        f.runtime.stop_container(&container_id).unwrap();
        let info = f.runtime.container_status(&container_id).unwrap().unwrap();
        assert_eq!(info.state, ContainerState::Exited);

        assert!(f.runtime.start_container("ghost").unwrap_err().is_not_found());
    }

    #[test]
    fn test_remove_container_drops_metadata_then_volume() {
        let f = fixture(true);
        let sandbox_id = prepared(&f);
        let container_id = f
            .runtime
            .create_container(&sandbox_id, &container_config())
            .unwrap();

        f.runtime.remove_container(&container_id).unwrap();

        assert!(f.runtime.container_status(&container_id).unwrap().is_none());
        assert_eq!(
            f.storage.volume_names(DEFAULT_POOL),
            [IMAGE_VOLUME]
        );
        let sandbox = f.runtime.store().get_pod_sandbox(&sandbox_id).unwrap().unwrap();
        assert_eq!(sandbox.container_id, "");

        // Second removal is a no-op
        f.runtime.remove_container(&container_id).unwrap();
        f.runtime.remove_pod_sandbox(&sandbox_id).unwrap();
    }

    #[test]
    fn test_concurrent_removals_of_one_container() {
        for _ in 0..20 {
            let f = fixture(true);
            let sandbox_id = prepared(&f);
            let container_id = f
                .runtime
                .create_container(&sandbox_id, &container_config())
                .unwrap();

            let barrier = Barrier::new(2);
            let remove = || {
                barrier.wait();
                f.runtime.remove_container(&container_id)
            };
            let results: Vec<RuntimeResult<()>> = std::thread::scope(|scope| {
                let first = scope.spawn(remove);
                let second = scope.spawn(remove);
                vec![first.join().unwrap(), second.join().unwrap()]
            });

            for result in results {
                assert!(result.is_ok(), "removal failed: {result:?}");
            }
            assert!(f.runtime.container_status(&container_id).unwrap().is_none());
            assert_eq!(f.storage.volume_names(DEFAULT_POOL), [IMAGE_VOLUME]);
            assert_eq!(
                f.runtime.store().get_pod_sandbox(&sandbox_id).unwrap().unwrap().container_id,
                ""
            );
        }
    }

    #[test]
    fn test_volume_failure_after_metadata_removal() {
        let f = fixture(true);
        let sandbox_id = prepared(&f);
        let container_id = f
            .runtime
            .create_container(&sandbox_id, &container_config())
            .unwrap();

        f.storage
            .fail_next(Operation::RemoveVolume, HypervisorError::other("device busy"));
        let err = f.runtime.remove_container(&container_id).unwrap_err();

        let RuntimeError::OrphanedVolume { volume, source, .. } = err else {
            panic!("expected an orphaned volume error");
        };
        assert_eq!(volume, root_volume_name(&container_id));
        assert!(matches!(source, StorageError::Hypervisor(_)));
        // Metadata is already gone, the volume is left for a sweep
        assert!(f.runtime.container_status(&container_id).unwrap().is_none());
        assert!(f.storage.volume_names(DEFAULT_POOL).contains(&volume));
    }
}
