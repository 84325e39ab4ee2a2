//! Serialized container state.
//!
//! The snapshot is a compatibility surface: the JSON field names and
//! structural shape here are what lands on disk at shutdown and what
//! restore reads at startup, so they must not drift between releases.
//! Absent limits are encoded as absent, never as zero values, and grace
//! time travels as integer nanoseconds.

use crate::container::State;
use crate::limits::{BandwidthLimits, CpuLimits, DiskLimits, MemoryLimits};
use crate::pools::Network;
use crate::spec::Properties;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete serialized state of one container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerSnapshot {
    pub id: String,
    pub handle: String,
    #[serde(with = "duration_nanos")]
    pub grace_time: Duration,
    pub state: State,
    pub events: Vec<String>,
    pub resources: ResourcesSnapshot,
    pub limits: LimitsSnapshot,
    pub net_ins: Vec<NetInRule>,
    pub net_outs: Vec<NetOutRule>,
    pub processes: Vec<ProcessSnapshot>,
    pub properties: Properties,
}

/// The resource triple a container holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesSnapshot {
    pub uid: u32,
    pub network: Network,
    pub ports: Vec<u32>,
}

impl Default for ResourcesSnapshot {
    fn default() -> Self {
        Self {
            uid: 0,
            network: Network::new(std::net::Ipv4Addr::UNSPECIFIED),
            ports: Vec::new(),
        }
    }
}

/// Limits in force when the snapshot was taken.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitsSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryLimits>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskLimits>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<BandwidthLimits>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuLimits>,
}

/// A host-to-container port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetInRule {
    pub host_port: u32,
    pub container_port: u32,
}

/// An outbound allow rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetOutRule {
    pub network: String,
    pub port: u32,
}

/// A supervised process, by ID only.
///
/// Stdio pipes do not survive a restart; re-attaching after restore
/// re-establishes the stream relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub id: u32,
}

mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}
