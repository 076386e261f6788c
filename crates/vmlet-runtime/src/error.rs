//! Runtime error types

use thiserror::Error;
use vmlet_meta_store::MetaStoreError;
use vmlet_storage::StorageError;

/// Runtime orchestration error
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    MetaStore(#[from] MetaStoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("container '{0}' doesn't exist")]
    ContainerNotFound(String),

    /// Metadata was removed but the root volume could not be
    #[error("container '{container_id}' removed but volume '{volume}' was left behind: {source}")]
    OrphanedVolume {
        container_id: String,
        volume: String,
        #[source]
        source: StorageError,
    },

    #[error("invalid image name '{0}'")]
    InvalidImage(String),
}

impl RuntimeError {
    /// Check if this is a not-found error from any layer
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::MetaStore(e) => e.is_not_found(),
            Self::Storage(e) => e.is_not_found(),
            Self::ContainerNotFound(_) => true,
            _ => false,
        }
    }
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
