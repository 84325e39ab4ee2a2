//! Limit and usage records for container resources.
//!
//! The four limit records (memory, disk, bandwidth, cpu) are applied
//! through a container's limit operations and cached after each successful
//! application so snapshots carry the last value actually enforced. The
//! `*Stat` records are point-in-time accounting read back for
//! introspection.

use serde::{Deserialize, Serialize};

// =============================================================================
// Limits
// =============================================================================

/// Memory ceiling for a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryLimits {
    /// Value written to `memory.limit_in_bytes`.
    pub limit_in_bytes: u64,
}

/// CPU weight for a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuLimits {
    /// Value written to `cpu.shares`.
    pub limit_in_shares: u64,
}

/// Disk quota for a container's user.
///
/// The `*_limit` fields set both the soft and hard value of their pair
/// when non-zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskLimits {
    pub block_limit: u64,
    pub block: u64,
    pub block_soft: u64,
    pub block_hard: u64,

    pub inode_limit: u64,
    pub inode: u64,
    pub inode_soft: u64,
    pub inode_hard: u64,

    pub byte_limit: u64,
    pub byte: u64,
    pub byte_soft: u64,
    pub byte_hard: u64,
}

/// Traffic-shaping rate for a container's interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthLimits {
    pub rate_in_bytes_per_second: u64,
    pub burst_rate_in_bytes_per_second: u64,
}

// =============================================================================
// Process rlimits
// =============================================================================

/// Kernel resource limits applied to one spawned process.
///
/// Only set fields are surfaced to the process supervisor, as
/// `RLIMIT_<NAME>=<value>` environment pairs in the canonical order AS,
/// CORE, CPU, DATA, FSIZE, LOCKS, MEMLOCK, MSGQUEUE, NICE, NOFILE, NPROC,
/// RSS, RTPRIO, SIGPENDING, STACK.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub address_space: Option<u64>,
    pub core: Option<u64>,
    pub cpu: Option<u64>,
    pub data: Option<u64>,
    pub fsize: Option<u64>,
    pub locks: Option<u64>,
    pub memlock: Option<u64>,
    pub msgqueue: Option<u64>,
    pub nice: Option<u64>,
    pub nofile: Option<u64>,
    pub nproc: Option<u64>,
    pub rss: Option<u64>,
    pub rtprio: Option<u64>,
    pub sigpending: Option<u64>,
    pub stack: Option<u64>,
}

impl ResourceLimits {
    /// Renders the set limits as environment pairs, in canonical order.
    pub fn to_env(&self) -> Vec<(String, String)> {
        let fields = [
            ("AS", self.address_space),
            ("CORE", self.core),
            ("CPU", self.cpu),
            ("DATA", self.data),
            ("FSIZE", self.fsize),
            ("LOCKS", self.locks),
            ("MEMLOCK", self.memlock),
            ("MSGQUEUE", self.msgqueue),
            ("NICE", self.nice),
            ("NOFILE", self.nofile),
            ("NPROC", self.nproc),
            ("RSS", self.rss),
            ("RTPRIO", self.rtprio),
            ("SIGPENDING", self.sigpending),
            ("STACK", self.stack),
        ];

        fields
            .into_iter()
            .filter_map(|(name, value)| {
                value.map(|v| (format!("RLIMIT_{name}"), v.to_string()))
            })
            .collect()
    }
}

// =============================================================================
// Usage statistics
// =============================================================================

/// Memory accounting parsed from the memory cgroup's `memory.stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStat {
    pub cache: u64,
    pub rss: u64,
    pub mapped_file: u64,
    pub pgpgin: u64,
    pub pgpgout: u64,
    pub swap: u64,
    pub pgfault: u64,
    pub pgmajfault: u64,
    pub inactive_anon: u64,
    pub active_anon: u64,
    pub inactive_file: u64,
    pub active_file: u64,
    pub unevictable: u64,
    pub hierarchical_memory_limit: u64,
    pub hierarchical_memsw_limit: u64,
    pub total_cache: u64,
    pub total_rss: u64,
    pub total_mapped_file: u64,
    pub total_pgpgin: u64,
    pub total_pgpgout: u64,
    pub total_swap: u64,
    pub total_pgfault: u64,
    pub total_pgmajfault: u64,
    pub total_inactive_anon: u64,
    pub total_active_anon: u64,
    pub total_inactive_file: u64,
    pub total_active_file: u64,
    pub total_unevictable: u64,
}

/// CPU accounting from the cpuacct cgroup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStat {
    /// Total nanoseconds from `cpuacct.usage`.
    pub usage: u64,
    /// User ticks from `cpuacct.stat`.
    pub user: u64,
    /// System ticks from `cpuacct.stat`.
    pub system: u64,
}

/// Disk usage reported by the quota subsystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskStat {
    pub bytes_used: u64,
    pub inodes_used: u64,
}

/// Traffic-shaping state reported for a container's interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthStat {
    pub in_rate: u64,
    pub in_burst: u64,
    pub out_rate: u64,
    pub out_burst: u64,
}
