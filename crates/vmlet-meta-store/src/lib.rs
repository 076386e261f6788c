//! vmlet Metadata Store - embedded container and sandbox bookkeeping
//!
//! This crate persists VM-backed container records and the pod sandboxes
//! they belong to in a local redb database. Creating or removing a
//! container updates the owning sandbox's back-reference in the same write
//! transaction, so the two collections never disagree after a commit.

mod batch;
pub mod clock;
mod container;
pub mod error;
mod record;
mod sandbox;
pub mod store;
pub mod tables;
pub mod types;

// Re-exports
pub use clock::{Clock, FakeClock, SystemClock};
pub use error::{MetaStoreError, MetaStoreResult};
pub use store::{MetaStore, MetaStoreOptions};
pub use types::{ContainerInfo, ContainerSpec, ContainerState, PodSandboxConfig, SandboxInfo};
