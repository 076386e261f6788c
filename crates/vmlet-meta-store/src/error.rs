//! Metadata store error types

use thiserror::Error;

/// Error type for metadata store operations
#[derive(Debug, Error)]
pub enum MetaStoreError {
    #[error("metadata store unavailable: {0}")]
    Unavailable(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A required top-level collection has not been created
    #[error("table '{0}' doesn't exist")]
    SchemaMissing(String),

    #[error("sandbox '{0}' doesn't exist")]
    SandboxNotFound(String),

    #[error("container '{0}' doesn't exist")]
    ContainerNotFound(String),

    /// The sandbox still references a container
    #[error("sandbox '{sandbox_id}' is still used by container '{container_id}'")]
    SandboxInUse {
        sandbox_id: String,
        container_id: String,
    },

    /// A stored value does not decode to the expected shape
    #[error("corrupt field '{field}' in record '{record}': {reason}")]
    Corrupt {
        record: String,
        field: String,
        reason: String,
    },

    #[error("failed to encode field '{field}': {reason}")]
    Encode { field: String, reason: String },

    /// The clock returned a time outside the nanosecond epoch range
    #[error("clock time is outside the representable range")]
    ClockOutOfRange,

    /// The thread running a batched write went away before reporting back
    #[error("batched write was abandoned before completing")]
    BatchAborted,
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl MetaStoreError {
    pub(crate) fn corrupt(
        record: impl Into<String>,
        field: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::Corrupt {
            record: record.into(),
            field: field.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this is a referential not-found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::SandboxNotFound(_) | Self::ContainerNotFound(_))
    }

    /// Errors that point at a missed initialization step or on-disk damage
    /// rather than ordinary control flow.
    #[must_use]
    pub const fn is_operational_alert(&self) -> bool {
        matches!(self, Self::SchemaMissing(_) | Self::Corrupt { .. })
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;
