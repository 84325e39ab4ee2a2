//! Request specifications for container and process creation.

use crate::limits::ResourceLimits;
use std::collections::HashMap;
use std::time::Duration;

/// Free-form labels attached to a container.
pub type Properties = HashMap<String, String>;

// =============================================================================
// Container Spec
// =============================================================================

/// Specification for a new container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Caller-facing handle. Empty means the generated ID is the handle.
    pub handle: String,
    /// How long the container outlives its last client reference.
    pub grace_time: Duration,
    /// Free-form labels, matchable when listing containers.
    pub properties: Properties,
    /// Host paths mounted into the container before pivoting.
    pub bind_mounts: Vec<BindMount>,
}

/// A single bind mount into the container filesystem.
#[derive(Debug, Clone)]
pub struct BindMount {
    /// Source path, interpreted per `origin`.
    pub src_path: String,
    /// Destination path inside the container.
    pub dst_path: String,
    /// Mount writability.
    pub mode: BindMountMode,
    /// Where the source path is rooted.
    pub origin: BindMountOrigin,
}

/// Writability of a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindMountMode {
    #[default]
    ReadOnly,
    ReadWrite,
}

impl BindMountMode {
    /// Mount option string used by the hook script.
    pub fn as_option(self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
        }
    }
}

/// Root of a bind mount's source path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindMountOrigin {
    /// Source is a host path.
    #[default]
    Host,
    /// Source is a path inside the container's own rootfs.
    Container,
}

// =============================================================================
// Process Spec
// =============================================================================

/// Specification for a process run inside a container.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Shell script fed to `/bin/bash` inside the container.
    pub script: String,
    /// Run as root instead of the unprivileged container user.
    pub privileged: bool,
    /// Variables exported before the script runs.
    pub env: Vec<EnvironmentVariable>,
    /// Kernel resource limits for the process.
    pub limits: ResourceLimits,
}

/// One exported environment variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentVariable {
    pub key: String,
    pub value: String,
}

impl EnvironmentVariable {
    /// Creates a variable.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}
