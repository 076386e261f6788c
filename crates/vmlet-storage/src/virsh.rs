//! libvirt storage backend driven through the `virsh` command line tool.
//!
//! Descriptors are written to temporary files and handed to `virsh`.
//! Failures are classified from virsh's error output.

use crate::descriptor::{parse_pool, parse_volume};
use crate::error::{HypervisorError, HypervisorErrorKind, HypervisorResult};
use crate::ops::{PoolHandle, StorageOperations, VolumeHandle, VolumeStats};
use std::ffi::OsStr;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use vmlet_common::StorageConfig;

/// [`StorageOperations`] backed by `virsh`
#[derive(Clone, Debug)]
pub struct VirshStorage {
    binary: PathBuf,
    connect_uri: String,
}

impl VirshStorage {
    pub fn new(binary: impl Into<PathBuf>, connect_uri: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            connect_uri: connect_uri.into(),
        }
    }

    #[must_use]
    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.virsh_binary, &config.connect_uri)
    }

    /// Run one virsh command and return its standard output.
    fn run<I, S>(&self, args: I) -> HypervisorResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.binary);
        command.arg("--connect").arg(&self.connect_uri).args(args);
        debug!("Running {:?}", command);

        let output = command.output().map_err(|e| {
            HypervisorError::new(
                HypervisorErrorKind::Connection,
                format!("failed to run {}: {e}", self.binary.display()),
            )
        })?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify(String::from_utf8_lossy(&output.stderr).trim()))
        }
    }

    /// Write `descriptor` to a temporary file that lives as long as the
    /// returned handle.
    fn descriptor_file(descriptor: &str) -> HypervisorResult<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("vmlet-")
            .suffix(".xml")
            .tempfile()
            .map_err(|e| HypervisorError::other(format!("failed to create descriptor file: {e}")))?;
        file.write_all(descriptor.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| HypervisorError::other(format!("failed to write descriptor file: {e}")))?;
        Ok(file)
    }

    fn create_volume(&self, pool: &str, descriptor: &str) -> HypervisorResult<VolumeHandle> {
        let name = parse_volume(descriptor)?.name;
        let file = Self::descriptor_file(descriptor)?;
        self.run([
            OsStr::new("vol-create"),
            OsStr::new("--pool"),
            OsStr::new(pool),
            file.path().as_os_str(),
        ])?;
        Ok(VolumeHandle::new(pool, name))
    }
}

/// Map virsh error output onto an error kind.
fn classify(stderr: &str) -> HypervisorError {
    let lower = stderr.to_ascii_lowercase();
    let kind = if lower.contains("no storage pool with matching")
        || lower.contains("no storage vol with matching")
        || lower.contains("not found")
    {
        HypervisorErrorKind::NotFound
    } else if lower.contains("already exists") {
        HypervisorErrorKind::AlreadyExists
    } else if lower.contains("failed to connect") {
        HypervisorErrorKind::Connection
    } else {
        HypervisorErrorKind::Other
    };
    HypervisorError::new(kind, stderr)
}

/// Volume names from `virsh vol-list` table output
fn parse_vol_list(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Capacity and allocation from `virsh vol-info --bytes` output
fn parse_vol_info(output: &str) -> HypervisorResult<VolumeStats> {
    let field = |label: &str| -> HypervisorResult<u64> {
        output
            .lines()
            .find_map(|line| line.strip_prefix(label))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| {
                HypervisorError::other(format!("unexpected vol-info output: missing {label}"))
            })
    };
    Ok(VolumeStats {
        capacity: field("Capacity:")?,
        allocation: field("Allocation:")?,
    })
}

impl StorageOperations for VirshStorage {
    fn lookup_pool_by_name(&self, name: &str) -> HypervisorResult<Option<PoolHandle>> {
        match self.run(["pool-info", name]) {
            Ok(_) => Ok(Some(PoolHandle::new(name))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_pool_from_descriptor(&self, descriptor: &str) -> HypervisorResult<PoolHandle> {
        let name = parse_pool(descriptor)?.name;
        let file = Self::descriptor_file(descriptor)?;
        self.run([OsStr::new("pool-create"), file.path().as_os_str()])?;
        Ok(PoolHandle::new(name))
    }

    fn create_volume_from_descriptor(
        &self,
        pool: &PoolHandle,
        descriptor: &str,
    ) -> HypervisorResult<VolumeHandle> {
        self.create_volume(pool.name(), descriptor)
    }

    fn lookup_volume_by_name(
        &self,
        pool: &PoolHandle,
        name: &str,
    ) -> HypervisorResult<VolumeHandle> {
        self.run(["vol-key", "--pool", pool.name(), name])?;
        Ok(VolumeHandle::new(pool.name(), name))
    }

    fn remove_volume(&self, volume: &VolumeHandle) -> HypervisorResult<()> {
        self.run(["vol-delete", "--pool", volume.pool(), volume.name()])?;
        Ok(())
    }

    fn list_all_volumes(&self, pool: &PoolHandle) -> HypervisorResult<Vec<VolumeHandle>> {
        let output = self.run(["vol-list", "--pool", pool.name()])?;
        Ok(parse_vol_list(&output)
            .into_iter()
            .map(|name| VolumeHandle::new(pool.name(), name))
            .collect())
    }

    fn volume_info(&self, volume: &VolumeHandle) -> HypervisorResult<VolumeStats> {
        let output = self.run([
            "vol-info",
            "--pool",
            volume.pool(),
            volume.name(),
            "--bytes",
        ])?;
        parse_vol_info(&output)
    }

    fn volume_path(&self, volume: &VolumeHandle) -> HypervisorResult<PathBuf> {
        let output = self.run(["vol-path", "--pool", volume.pool(), volume.name()])?;
        Ok(PathBuf::from(output.trim()))
    }

    fn volume_name(&self, volume: &VolumeHandle) -> HypervisorResult<String> {
        Ok(volume.name().to_string())
    }

    fn transfer_image_into_volume(
        &self,
        pool: &PoolHandle,
        volume_name: &str,
        source: &Path,
        descriptor: &str,
    ) -> HypervisorResult<()> {
        let volume = self.create_volume(pool.name(), descriptor)?;
        let uploaded = self.run([
            OsStr::new("vol-upload"),
            OsStr::new("--pool"),
            OsStr::new(pool.name()),
            OsStr::new(volume_name),
            source.as_os_str(),
        ]);
        if let Err(e) = uploaded {
            if let Err(cleanup) = self.remove_volume(&volume) {
                warn!(
                    "Failed to remove volume '{}' after failed upload: {}",
                    volume_name, cleanup
                );
            }
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_errors() {
        let err = classify(
            "error: failed to get pool 'default'\nerror: Storage pool not found: no storage pool with matching name 'default'",
        );
        assert!(err.is_not_found());

        let err = classify("error: operation failed: pool 'default' already exists with uuid 1234");
        assert_eq!(err.kind, HypervisorErrorKind::AlreadyExists);

        let err = classify("error: failed to connect to the hypervisor");
        assert_eq!(err.kind, HypervisorErrorKind::Connection);

        assert_eq!(classify("error: boom").kind, HypervisorErrorKind::Other);
    }

    #[test]
    fn test_parse_vol_list() {
        let output = " Name          Path\n\
                      ---------------------------------------------\n \
                      base.qcow2    /var/lib/libvirt/images/base.qcow2\n \
                      vm1-root      /var/lib/libvirt/images/vm1-root\n\n";
        assert_eq!(parse_vol_list(output), ["base.qcow2", "vm1-root"]);
        assert!(parse_vol_list(" Name   Path\n------------\n\n").is_empty());
    }

    #[test]
    fn test_parse_vol_info() {
        let output = "Name:           base.qcow2\n\
                      Type:           file\n\
                      Capacity:       1073741824 bytes\n\
                      Allocation:     200704 bytes\n";
        let stats = parse_vol_info(output).unwrap();
        assert_eq!(stats.capacity, 1_073_741_824);
        assert_eq!(stats.allocation, 200_704);

        assert!(parse_vol_info("Name: x\n").is_err());
    }

    #[test]
    fn test_missing_binary_is_connection_error() {
        let virsh = VirshStorage::new("/nonexistent/virsh", "qemu:///system");
        let err = virsh.lookup_pool_by_name("default").unwrap_err();
        assert_eq!(err.kind, HypervisorErrorKind::Connection);
    }
}
