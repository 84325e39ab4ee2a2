//! Shared constants for the container backend.
//!
//! Centralizes the values that scripts and the kernel interface depend on.
//! Changing any of these changes the on-disk and on-wire contract with the
//! isolation scripts, so they live here rather than inline at call sites.

/// Canonical `PATH` handed to every isolation script.
pub const SCRIPT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// MTU configured on the container-side network interface.
pub const CONTAINER_IFACE_MTU: u32 = 1500;

/// Root of the per-container cgroup subtrees.
///
/// Each container owns `<root>/<subsystem>/instance-<id>/` for every
/// subsystem in [`CGROUP_SUBSYSTEMS`].
pub const DEFAULT_CGROUP_ROOT: &str = "/tmp/warden/cgroup";

/// Cgroup subsystems set up per container.
pub const CGROUP_SUBSYSTEMS: &[&str] = &["cpu", "cpuset", "cpuacct", "memory", "devices"];

/// Depot entry reserved for scratch space; never pruned.
pub const DEPOT_TMP_DIR: &str = "tmp";

/// User that unprivileged container processes run as.
pub const CONTAINER_USER: &str = "vcap";

/// User that privileged container processes run as.
pub const ROOT_USER: &str = "root";

/// Number of base-32 digits in a container ID.
pub const CONTAINER_ID_DIGITS: usize = 11;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_path_is_absolute_dirs() {
        for dir in SCRIPT_PATH.split(':') {
            assert!(dir.starts_with('/'), "non-absolute PATH entry: {dir}");
        }
    }

    #[test]
    fn test_cgroup_subsystems_include_memory_and_cpu() {
        assert!(CGROUP_SUBSYSTEMS.contains(&"memory"));
        assert!(CGROUP_SUBSYSTEMS.contains(&"cpu"));
        assert!(CGROUP_SUBSYSTEMS.contains(&"cpuacct"));
    }
}
