//! Point-in-time container introspection.

use crate::container::State;
use crate::limits::{BandwidthStat, CpuStat, DiskStat, MemoryStat};
use crate::spec::Properties;
use std::path::PathBuf;

/// Snapshot-free report of a container's live state.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub state: State,
    pub events: Vec<String>,
    pub properties: Properties,
    pub container_path: PathBuf,
    pub host_ip: String,
    pub container_ip: String,
    pub process_ids: Vec<u32>,
    pub memory_stat: MemoryStat,
    pub cpu_stat: CpuStat,
    pub disk_stat: DiskStat,
    pub bandwidth_stat: BandwidthStat,
}

/// Parses the memory cgroup's `memory.stat` key/value lines.
///
/// Unknown keys and malformed lines are skipped; the kernel grows this
/// file over time.
pub(crate) fn parse_memory_stat(raw: &str) -> MemoryStat {
    let mut stat = MemoryStat::default();

    for line in raw.lines() {
        let Some((key, value)) = line.split_once(' ') else {
            continue;
        };
        let Ok(value) = value.trim().parse::<u64>() else {
            continue;
        };

        match key {
            "cache" => stat.cache = value,
            "rss" => stat.rss = value,
            "mapped_file" => stat.mapped_file = value,
            "pgpgin" => stat.pgpgin = value,
            "pgpgout" => stat.pgpgout = value,
            "swap" => stat.swap = value,
            "pgfault" => stat.pgfault = value,
            "pgmajfault" => stat.pgmajfault = value,
            "inactive_anon" => stat.inactive_anon = value,
            "active_anon" => stat.active_anon = value,
            "inactive_file" => stat.inactive_file = value,
            "active_file" => stat.active_file = value,
            "unevictable" => stat.unevictable = value,
            "hierarchical_memory_limit" => stat.hierarchical_memory_limit = value,
            "hierarchical_memsw_limit" => stat.hierarchical_memsw_limit = value,
            "total_cache" => stat.total_cache = value,
            "total_rss" => stat.total_rss = value,
            "total_mapped_file" => stat.total_mapped_file = value,
            "total_pgpgin" => stat.total_pgpgin = value,
            "total_pgpgout" => stat.total_pgpgout = value,
            "total_swap" => stat.total_swap = value,
            "total_pgfault" => stat.total_pgfault = value,
            "total_pgmajfault" => stat.total_pgmajfault = value,
            "total_inactive_anon" => stat.total_inactive_anon = value,
            "total_active_anon" => stat.total_active_anon = value,
            "total_inactive_file" => stat.total_inactive_file = value,
            "total_active_file" => stat.total_active_file = value,
            "total_unevictable" => stat.total_unevictable = value,
            _ => {}
        }
    }

    stat
}

/// Parses `cpuacct.stat` into (user, system) ticks.
pub(crate) fn parse_cpuacct_stat(raw: &str) -> (u64, u64) {
    let mut user = 0;
    let mut system = 0;

    for line in raw.lines() {
        let Some((key, value)) = line.split_once(' ') else {
            continue;
        };
        let Ok(value) = value.trim().parse::<u64>() else {
            continue;
        };

        match key {
            "user" => user = value,
            "system" => system = value,
            _ => {}
        }
    }

    (user, system)
}
