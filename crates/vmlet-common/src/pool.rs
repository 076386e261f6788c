//! Storage pool catalog
//!
//! The catalog maps logical pool names to the host directory backing them.
//! It is plain configuration: the storage layer consults it to decide which
//! pools may exist and how to define them on first use.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Pool holding VM root images and their writable snapshots
pub const DEFAULT_POOL: &str = "default";

/// Pool holding auxiliary data volumes
pub const VOLUMES_POOL: &str = "volumes";

/// Backing type of a storage pool
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// Plain host directory
    #[default]
    Dir,
}

impl PoolKind {
    /// Name used for the pool `type` attribute in libvirt descriptors
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dir => "dir",
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog entry for a single pool
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    /// Root directory of the pool on the host
    pub path: PathBuf,
    /// Pool backing type
    #[serde(default)]
    pub kind: PoolKind,
}

impl PoolSpec {
    /// Create a directory-backed pool entry
    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: PoolKind::Dir,
        }
    }
}

/// Named pools the storage layer is allowed to create and use
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolCatalog {
    pools: BTreeMap<String, PoolSpec>,
}

impl PoolCatalog {
    /// Create an empty catalog
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            pools: BTreeMap::new(),
        }
    }

    /// Add or replace a pool entry
    #[must_use]
    pub fn with_pool(mut self, name: impl Into<String>, spec: PoolSpec) -> Self {
        self.pools.insert(name.into(), spec);
        self
    }

    /// Look up a pool by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PoolSpec> {
        self.pools.get(name)
    }

    /// Iterate over catalog entries in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PoolSpec)> {
        self.pools.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    /// Number of pools in the catalog
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Whether the catalog is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Root path of a pool, if known
    #[must_use]
    pub fn path_of(&self, name: &str) -> Option<&Path> {
        self.pools.get(name).map(|spec| spec.path.as_path())
    }
}

impl Default for PoolCatalog {
    fn default() -> Self {
        Self::empty()
            .with_pool(DEFAULT_POOL, PoolSpec::dir("/var/lib/libvirt/images"))
            .with_pool(VOLUMES_POOL, PoolSpec::dir("/var/lib/virtlet"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog() {
        let catalog = PoolCatalog::default();
        assert_eq!(catalog.len(), 2);
        assert_eq!(
            catalog.path_of(DEFAULT_POOL),
            Some(Path::new("/var/lib/libvirt/images"))
        );
        assert_eq!(
            catalog.path_of(VOLUMES_POOL),
            Some(Path::new("/var/lib/virtlet"))
        );
        assert!(catalog.get("nonexistent-name").is_none());
    }

    #[test]
    fn test_catalogs_are_independent() {
        let a = PoolCatalog::empty().with_pool("scratch", PoolSpec::dir("/tmp/a"));
        let b = PoolCatalog::empty().with_pool("scratch", PoolSpec::dir("/tmp/b"));
        assert_eq!(a.path_of("scratch"), Some(Path::new("/tmp/a")));
        assert_eq!(b.path_of("scratch"), Some(Path::new("/tmp/b")));
    }

    #[test]
    fn test_pool_kind_name() {
        assert_eq!(PoolKind::Dir.as_str(), "dir");
        assert_eq!(PoolKind::default().to_string(), "dir");
    }
}
