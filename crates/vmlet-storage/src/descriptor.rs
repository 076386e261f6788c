//! libvirt XML descriptors for pools and volumes.
//!
//! Descriptors are built from plain parameters and serialized with
//! quick-xml. Nothing here performs I/O.

use crate::error::{HypervisorError, HypervisorResult, StorageError, StorageResult};
use quick_xml::de::from_str as from_xml;
use quick_xml::se::to_string as to_xml;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use vmlet_common::PoolSpec;

/// Image format used for snapshots and their backing stores
pub const QCOW2: &str = "qcow2";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "pool")]
pub(crate) struct PoolDescriptor {
    #[serde(rename = "@type")]
    pub kind: String,
    pub name: String,
    pub target: Target,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Target {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Format {
    #[serde(rename = "@type")]
    pub kind: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "volume")]
pub(crate) struct VolumeDescriptor {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub name: String,
    pub allocation: u64,
    pub capacity: Capacity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    #[serde(
        rename = "backingStore",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub backing_store: Option<BackingStore>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Capacity {
    #[serde(rename = "@unit")]
    pub unit: String,
    #[serde(rename = "$text")]
    pub value: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct BackingStore {
    pub path: PathBuf,
    pub format: Format,
}

fn qcow2() -> Format {
    Format {
        kind: QCOW2.to_string(),
    }
}

/// Build the descriptor defining pool `name` from its catalog entry.
pub fn pool_descriptor(name: &str, spec: &PoolSpec) -> StorageResult<String> {
    if name.is_empty() {
        return Err(StorageError::Descriptor("pool name is empty".into()));
    }
    let descriptor = PoolDescriptor {
        kind: spec.kind.as_str().to_string(),
        name: name.to_string(),
        target: Target {
            path: Some(spec.path.clone()),
            format: None,
        },
    };
    to_xml(&descriptor).map_err(|e| StorageError::Descriptor(e.to_string()))
}

/// Parameters of a volume descriptor
///
/// A plain volume only has a name and a capacity. Adding a backing store
/// turns it into a qcow2 copy-on-write snapshot of that file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeSpec {
    name: String,
    capacity: u64,
    unit: String,
    path: Option<PathBuf>,
    backing_store: Option<PathBuf>,
}

impl VolumeSpec {
    pub fn new(name: impl Into<String>, capacity: u64, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity,
            unit: unit.into(),
            path: None,
            backing_store: None,
        }
    }

    /// Place the volume at an explicit file path
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Make the volume a qcow2 snapshot of the image at `path`
    #[must_use]
    pub fn with_backing_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.backing_store = Some(path.into());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capacity in bytes, or `None` if the unit is not recognized
    #[must_use]
    pub fn capacity_bytes(&self) -> Option<u64> {
        capacity_in_bytes(self.capacity, &self.unit)
    }

    /// Serialize to a libvirt volume descriptor.
    pub fn to_xml(&self) -> StorageResult<String> {
        self.validate()?;

        let snapshot = self.backing_store.is_some();
        let target = (self.path.is_some() || snapshot).then(|| Target {
            path: self.path.clone(),
            format: snapshot.then(qcow2),
        });
        let descriptor = VolumeDescriptor {
            kind: snapshot.then(|| "file".to_string()),
            name: self.name.clone(),
            allocation: 0,
            capacity: Capacity {
                unit: self.unit.clone(),
                value: self.capacity,
            },
            target,
            backing_store: self.backing_store.as_ref().map(|path| BackingStore {
                path: path.clone(),
                format: qcow2(),
            }),
        };
        to_xml(&descriptor).map_err(|e| StorageError::Descriptor(e.to_string()))
    }

    fn validate(&self) -> StorageResult<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(StorageError::Descriptor(format!(
                "invalid volume name '{}'",
                self.name
            )));
        }
        if self.capacity_bytes().is_none() {
            return Err(StorageError::Descriptor(format!(
                "invalid capacity {} {}",
                self.capacity, self.unit
            )));
        }
        if let Some(path) = &self.backing_store
            && !path.is_absolute()
        {
            return Err(StorageError::Descriptor(format!(
                "backing store path '{}' is not absolute",
                path.display()
            )));
        }
        Ok(())
    }
}

/// Convert a libvirt capacity to bytes.
///
/// Follows libvirt's unit rules: `K`, `KiB`, `M`, `MiB`... are powers of
/// 1024 while `KB`, `MB`... are powers of 1000. The prefix letter is case
/// insensitive. Returns `None` for unknown units or on overflow.
#[must_use]
pub fn capacity_in_bytes(value: u64, unit: &str) -> Option<u64> {
    if matches!(unit, "" | "b" | "B" | "bytes") {
        return Some(value);
    }
    let mut chars = unit.chars();
    let exponent = match chars.next()?.to_ascii_lowercase() {
        'k' => 1,
        'm' => 2,
        'g' => 3,
        't' => 4,
        'p' => 5,
        'e' => 6,
        _ => return None,
    };
    let base: u64 = match chars.as_str() {
        "" | "iB" => 1024,
        "B" => 1000,
        _ => return None,
    };
    value.checked_mul(base.checked_pow(exponent)?)
}

pub(crate) fn parse_pool(xml: &str) -> HypervisorResult<PoolDescriptor> {
    from_xml(xml).map_err(|e| HypervisorError::other(format!("invalid pool descriptor: {e}")))
}

pub(crate) fn parse_volume(xml: &str) -> HypervisorResult<VolumeDescriptor> {
    from_xml(xml).map_err(|e| HypervisorError::other(format!("invalid volume descriptor: {e}")))
}

impl VolumeDescriptor {
    /// Capacity in bytes as the hypervisor would allocate it
    pub(crate) fn capacity_bytes(&self) -> HypervisorResult<u64> {
        capacity_in_bytes(self.capacity.value, &self.capacity.unit).ok_or_else(|| {
            HypervisorError::other(format!("invalid capacity unit '{}'", self.capacity.unit))
        })
    }

    /// Explicit target path, if the descriptor sets one
    pub(crate) fn target_path(&self) -> Option<&Path> {
        self.target.as_ref()?.path.as_deref()
    }
}
