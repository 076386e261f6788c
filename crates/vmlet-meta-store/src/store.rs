//! Persistent metadata store backed by redb.
//!
//! Opening the database never creates tables. The container and sandbox
//! collections are created by explicit schema initialization, and every
//! operation on a collection that has not been initialized fails with
//! `SchemaMissing` instead of silently creating it.

use crate::batch::{BatchFn, Batcher};
use crate::clock::{Clock, SystemClock};
use crate::error::{MetaStoreError, MetaStoreResult};
use crate::tables::{self, FieldKey, FieldValue, RecordTable};
use redb::{
    Database, ReadOnlyTable, ReadTransaction, Table, TableError, TableHandle, WriteTransaction,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use vmlet_common::BatchConfig;

/// Tunables for [`MetaStore::open_with`]
#[derive(Clone)]
pub struct MetaStoreOptions {
    /// Source of `createdAt` timestamps
    pub clock: Arc<dyn Clock>,
    pub batch: BatchConfig,
}

impl Default for MetaStoreOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            batch: BatchConfig::default(),
        }
    }
}

/// Persistent container and sandbox metadata
pub struct MetaStore {
    db: Database,
    clock: Arc<dyn Clock>,
    batcher: Batcher,
}

impl MetaStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        Self::open_with(path, MetaStoreOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: MetaStoreOptions) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        info!("Opened metadata store at {}", path.display());

        Ok(Self {
            db,
            clock: options.clock,
            batcher: Batcher::new(&options.batch),
        })
    }

    /// Create the container collection if it does not exist yet.
    pub fn ensure_schema(&self) -> MetaStoreResult<()> {
        self.create_table(tables::VIRTUALIZATION)
    }

    pub(crate) fn create_table(&self, definition: RecordTable) -> MetaStoreResult<()> {
        self.update(|txn| {
            txn.open_table(definition)?;
            Ok(())
        })
    }

    /// Run `f` in its own write transaction, committing on success.
    pub(crate) fn update<R>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> MetaStoreResult<R>,
    ) -> MetaStoreResult<R> {
        write_txn(&self.db, f)
    }

    /// Run `f` against a consistent read snapshot.
    pub(crate) fn view<R>(
        &self,
        f: impl FnOnce(&ReadTransaction) -> MetaStoreResult<R>,
    ) -> MetaStoreResult<R> {
        let txn = self.db.begin_read()?;
        f(&txn)
    }

    /// Run `func` through the batched commit path.
    pub(crate) fn batch(&self, func: BatchFn) -> MetaStoreResult<()> {
        self.batcher.run(&self.db, func)
    }

    /// Current clock reading in nanoseconds since the epoch
    pub(crate) fn now_nanos(&self) -> MetaStoreResult<i64> {
        self.clock
            .now()
            .timestamp_nanos_opt()
            .ok_or(MetaStoreError::ClockOutOfRange)
    }
}

/// Begin a write transaction, run `f` and commit. The transaction is
/// aborted if `f` fails.
pub(crate) fn write_txn<R>(
    db: &Database,
    f: impl FnOnce(&WriteTransaction) -> MetaStoreResult<R>,
) -> MetaStoreResult<R> {
    let txn = db.begin_write()?;
    match f(&txn) {
        Ok(value) => {
            txn.commit()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(abort) = txn.abort() {
                warn!("Failed to abort write transaction: {}", abort);
            }
            Err(e)
        }
    }
}

/// Open a table inside a write transaction without creating it.
pub(crate) fn open_existing<'txn>(
    txn: &'txn WriteTransaction,
    definition: RecordTable,
) -> MetaStoreResult<Table<'txn, FieldKey, FieldValue>> {
    let name = definition.name();
    let exists = txn.list_tables()?.any(|handle| handle.name() == name);
    if !exists {
        return Err(MetaStoreError::SchemaMissing(name.to_string()));
    }
    Ok(txn.open_table(definition)?)
}

/// Open a table inside a read transaction.
pub(crate) fn open_readable(
    txn: &ReadTransaction,
    definition: RecordTable,
) -> MetaStoreResult<ReadOnlyTable<FieldKey, FieldValue>> {
    txn.open_table(definition).map_err(|e| match e {
        TableError::TableDoesNotExist(name) => MetaStoreError::SchemaMissing(name),
        other => other.into(),
    })
}
