//! Pod sandbox records.
//!
//! Sandboxes are normally written by the sandbox allocator; these methods
//! let the node maintain them locally. Container operations only ever
//! read a sandbox's annotations and update its `ContainerID`.

use crate::error::{MetaStoreError, MetaStoreResult};
use crate::record::{
    FieldReader, decode_sandbox, delete_record, encode_sandbox, read_fields, record_ids,
    sandbox_field, write_fields,
};
use crate::store::{MetaStore, open_existing, open_readable};
use crate::tables;
use crate::types::{PodSandboxConfig, SandboxInfo};
use tracing::{debug, info};

impl MetaStore {
    /// Create the sandbox collection if it does not exist yet.
    pub fn ensure_sandbox_schema(&self) -> MetaStoreResult<()> {
        self.create_table(tables::SANDBOX)
    }

    /// Create or replace a sandbox record.
    ///
    /// A replaced record keeps its current `ContainerID`.
    pub fn set_pod_sandbox(&self, sandbox_id: &str, config: &PodSandboxConfig) -> MetaStoreResult<()> {
        let created_at = self.now_nanos()?;

        self.update(|txn| {
            let mut sandboxes = open_existing(txn, tables::SANDBOX)?;
            let container_id = match read_fields(&sandboxes, sandbox_id)? {
                Some(fields) => {
                    FieldReader::new(sandbox_id, &fields).string(sandbox_field::CONTAINER_ID)?
                }
                None => String::new(),
            };

            let fields = encode_sandbox(config, created_at, &container_id)?;
            delete_record(&mut sandboxes, sandbox_id)?;
            write_fields(&mut sandboxes, sandbox_id, &fields)
        })?;

        info!("Stored pod sandbox '{}' ({})", sandbox_id, config.name);
        Ok(())
    }

    pub fn get_pod_sandbox(&self, sandbox_id: &str) -> MetaStoreResult<Option<SandboxInfo>> {
        self.view(|txn| {
            let sandboxes = open_readable(txn, tables::SANDBOX)?;
            read_fields(&sandboxes, sandbox_id)?
                .map(|fields| decode_sandbox(sandbox_id, &fields))
                .transpose()
        })
    }

    pub fn list_pod_sandboxes(&self) -> MetaStoreResult<Vec<SandboxInfo>> {
        self.view(|txn| {
            let sandboxes = open_readable(txn, tables::SANDBOX)?;
            let mut result = Vec::new();
            for id in record_ids(&sandboxes)? {
                if let Some(fields) = read_fields(&sandboxes, &id)? {
                    result.push(decode_sandbox(&id, &fields)?);
                }
            }
            Ok(result)
        })
    }

    /// Delete a sandbox that no container refers to.
    pub fn remove_pod_sandbox(&self, sandbox_id: &str) -> MetaStoreResult<()> {
        self.update(|txn| {
            let mut sandboxes = open_existing(txn, tables::SANDBOX)?;
            let fields = read_fields(&sandboxes, sandbox_id)?
                .ok_or_else(|| MetaStoreError::SandboxNotFound(sandbox_id.to_string()))?;

            let container_id =
                FieldReader::new(sandbox_id, &fields).string(sandbox_field::CONTAINER_ID)?;
            if !container_id.is_empty() {
                return Err(MetaStoreError::SandboxInUse {
                    sandbox_id: sandbox_id.to_string(),
                    container_id,
                });
            }

            delete_record(&mut sandboxes, sandbox_id)?;
            Ok(())
        })?;

        debug!("Removed pod sandbox '{}'", sandbox_id);
        Ok(())
    }
}
