//! Pod sandbox verbs. These touch only the metadata store.

use crate::error::RuntimeResult;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use vmlet_meta_store::{MetaStore, PodSandboxConfig};

#[derive(Clone)]
pub struct SandboxService {
    store: Arc<MetaStore>,
}

impl SandboxService {
    pub const fn new(store: Arc<MetaStore>) -> Self {
        Self { store }
    }

    /// Mint a sandbox id and write its record.
    pub fn run_pod_sandbox(&self, config: &PodSandboxConfig) -> RuntimeResult<String> {
        let sandbox_id = Uuid::new_v4().to_string();
        self.store.set_pod_sandbox(&sandbox_id, config)?;
        info!("Created pod sandbox {} ({})", sandbox_id, config.name);
        Ok(sandbox_id)
    }

    pub fn remove_pod_sandbox(&self, sandbox_id: &str) -> RuntimeResult<()> {
        self.store.remove_pod_sandbox(sandbox_id)?;
        info!("Removed pod sandbox {}", sandbox_id);
        Ok(())
    }
}
