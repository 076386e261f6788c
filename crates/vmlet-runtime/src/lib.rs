//! vmlet Runtime - CRI container lifecycle over VM disks
//!
//! Binds the metadata store and the image storage pool to the CRI
//! sandbox and container verbs, and keeps them consistent through the
//! order in which it touches each side.

pub mod error;
pub mod sandbox;
pub mod service;

pub use error::{RuntimeError, RuntimeResult};
pub use sandbox::SandboxService;
pub use service::{ContainerConfig, RuntimeService, image_volume_name, root_volume_name};
