//! Storage error types

use std::fmt;
use thiserror::Error;

/// Storage pool and volume error
#[derive(Error, Debug)]
pub enum StorageError {
    /// Pool name is not in the catalog
    #[error("pool with name '{0}' is unknown")]
    UnknownPool(String),

    /// Error reported by the hypervisor, passed through unchanged
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    /// Descriptor could not be built from the given parameters
    #[error("Descriptor error: {0}")]
    Descriptor(String),
}

impl StorageError {
    /// Check if the hypervisor reported a missing pool or volume
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Hypervisor(e) if e.is_not_found())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Broad class of a hypervisor failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HypervisorErrorKind {
    NotFound,
    AlreadyExists,
    /// The hypervisor could not be reached
    Connection,
    Other,
}

impl fmt::Display for HypervisorErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::Connection => "connection failed",
            Self::Other => "hypervisor error",
        })
    }
}

/// Failure reported by a storage capability implementation
#[derive(Error, Clone, Debug, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct HypervisorError {
    pub kind: HypervisorErrorKind,
    pub message: String,
}

impl HypervisorError {
    pub fn new(kind: HypervisorErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(HypervisorErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(HypervisorErrorKind::AlreadyExists, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(HypervisorErrorKind::Other, message)
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind, HypervisorErrorKind::NotFound)
    }
}

/// Result type for capability calls
pub type HypervisorResult<T> = Result<T, HypervisorError>;
