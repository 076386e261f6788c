//! Record types exposed by the metadata store.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// CRI container state
///
/// The discriminants are the CRI enumeration values and are persisted as a
/// single byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ContainerState {
    Created = 0,
    Running = 1,
    Exited = 2,
    Unknown = 3,
}

impl ContainerState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Exited => "EXITED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl From<ContainerState> for u8 {
    fn from(state: ContainerState) -> Self {
        state as Self
    }
}

impl TryFrom<u8> for ContainerState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Created),
            1 => Ok(Self::Running),
            2 => Ok(Self::Exited),
            3 => Ok(Self::Unknown),
            other => Err(other),
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Caller-supplied attributes of a new container record
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    /// Sandbox the container runs in; must already exist
    pub sandbox_id: String,
    pub image: String,
    /// Volume holding the container's root filesystem
    pub root_image_volume_name: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub attempt: u32,
}

/// Container record joined with its sandbox's annotations
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub sandbox_id: String,
    pub image: String,
    pub root_image_volume_name: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub sandbox_annotations: HashMap<String, String>,
    pub state: ContainerState,
    /// Creation time, nanoseconds since the epoch
    pub created_at: i64,
    /// Start time, nanoseconds since the epoch; `None` until started
    pub started_at: Option<i64>,
    pub attempt: u32,
}

/// Pod sandbox metadata supplied at sandbox creation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodSandboxConfig {
    pub name: String,
    pub uid: String,
    pub namespace: String,
    pub attempt: u32,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
}

/// Stored pod sandbox record
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SandboxInfo {
    pub id: String,
    pub name: String,
    pub uid: String,
    pub namespace: String,
    pub attempt: u32,
    pub created_at: i64,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    /// Container currently associated with the sandbox, empty when none
    pub container_id: String,
}
