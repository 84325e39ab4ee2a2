//! The container allocator.
//!
//! Minting a container coordinates three finite pools (user IDs, /30
//! subnets, ports), a deterministic identity, and the isolation scripts.
//! Acquisition is failure-atomic: any step that fails releases everything
//! acquired before it, in reverse order, so a half-created container never
//! strands host resources.
//!
//! Restore is the inverse direction: the exact resources a snapshot names
//! are reserved out of the pools (releasing them all again if any single
//! reservation fails), then the container replays its own state.
//!
//! # Identity
//!
//! Container IDs come from a dedicated generator task: a counter seeded
//! with the wall-clock nanosecond time, each draw rendered as 11 base-32
//! digits sliced from bits 55..0 in 5-bit strides. Bit 55 (not 63) keeps
//! the leading digit small; the scheme must not change, because IDs are
//! depot directory names that survive restarts.

use crate::bandwidth::ScriptBandwidthManager;
use crate::cgroups::FsCgroupsManager;
use crate::command::{Command, CommandRunner};
use crate::constants::{CONTAINER_ID_DIGITS, DEFAULT_CGROUP_ROOT, DEPOT_TMP_DIR, SCRIPT_PATH};
use crate::container::{Container, ContainerSnapshot, Resources};
use crate::error::{Error, Result};
use crate::pools::{PortAllocator, SubnetAllocator, UidAllocator};
use crate::quota::QuotaManager;
use crate::spec::{BindMount, BindMountOrigin, ContainerSpec};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Filesystem layout and network policy for a pool.
#[derive(Debug, Clone)]
pub struct ContainerPoolConfig {
    /// Directory holding `setup.sh`, `create.sh`, `destroy.sh`, `quota.sh`.
    pub bin_path: PathBuf,
    /// Directory holding one subdirectory per live container.
    pub depot_path: PathBuf,
    /// Root filesystem template for new containers.
    pub rootfs_path: PathBuf,
    /// Root of the per-container cgroup subtrees.
    pub cgroup_root: PathBuf,
    /// Networks containers may not reach.
    pub deny_networks: Vec<String>,
    /// Exceptions to `deny_networks`.
    pub allow_networks: Vec<String>,
}

impl Default for ContainerPoolConfig {
    fn default() -> Self {
        Self {
            bin_path: PathBuf::new(),
            depot_path: PathBuf::new(),
            rootfs_path: PathBuf::new(),
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            deny_networks: Vec::new(),
            allow_networks: Vec::new(),
        }
    }
}

// =============================================================================
// ContainerPool
// =============================================================================

/// Allocator and deallocator of containers on one host.
pub struct ContainerPool {
    config: ContainerPoolConfig,

    uid_pool: Arc<dyn UidAllocator>,
    network_pool: Arc<dyn SubnetAllocator>,
    port_pool: Arc<dyn PortAllocator>,

    runner: Arc<dyn CommandRunner>,
    quota: Arc<dyn QuotaManager>,

    ids: tokio::sync::Mutex<mpsc::Receiver<String>>,
}

impl ContainerPool {
    /// Creates a pool and starts its ID generator.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: ContainerPoolConfig,
        uid_pool: Arc<dyn UidAllocator>,
        network_pool: Arc<dyn SubnetAllocator>,
        port_pool: Arc<dyn PortAllocator>,
        runner: Arc<dyn CommandRunner>,
        quota: Arc<dyn QuotaManager>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let seed = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default() as u64;
        tokio::spawn(generate_ids(seed, tx));

        Self {
            config,
            uid_pool,
            network_pool,
            port_pool,
            runner,
            quota,
            ids: tokio::sync::Mutex::new(rx),
        }
    }

    /// Upper bound on simultaneously live containers.
    pub fn max_containers(&self) -> usize {
        self.uid_pool
            .initial_size()
            .min(self.network_pool.initial_size())
    }

    /// One-time host preparation. Called once per process lifetime.
    pub async fn setup(&self) -> Result<()> {
        let command = Command::new(self.config.bin_path.join("setup.sh"))
            .env("POOL_NETWORK", self.network_pool.supernet())
            .env("DENY_NETWORKS", self.config.deny_networks.join(" "))
            .env("ALLOW_NETWORKS", self.config.allow_networks.join(" "))
            .env(
                "CONTAINER_ROOTFS_PATH",
                self.config.rootfs_path.to_string_lossy(),
            )
            .env(
                "CONTAINER_DEPOT_PATH",
                self.config.depot_path.to_string_lossy(),
            )
            .env("CONTAINER_DEPOT_MOUNT_POINT_PATH", self.quota.mount_point())
            .env("DISK_QUOTA_ENABLED", self.quota.is_enabled().to_string())
            .env("PATH", SCRIPT_PATH);

        self.runner.run(command).await?;
        Ok(())
    }

    /// Destroys every depot entry not in `keep`, reclaiming orphans left
    /// by a prior crash. The reserved `tmp` entry is never touched. The
    /// first destroy failure aborts the walk.
    pub async fn prune(&self, keep: &HashSet<String>) -> Result<()> {
        let listing = self
            .runner
            .run(Command::new("ls").arg(self.config.depot_path.to_string_lossy()))
            .await?;

        for id in String::from_utf8_lossy(&listing).lines() {
            if id.is_empty() || id == DEPOT_TMP_DIR || keep.contains(id) {
                continue;
            }

            info!(id, "pruning orphaned container");
            self.run_destroy(id).await?;
        }

        Ok(())
    }

    /// Mints a new container.
    ///
    /// Steps, each failure compensating in reverse order: acquire UID,
    /// acquire subnet, draw ID, construct, run `create.sh`, write bind
    /// mount hooks.
    pub async fn create(&self, spec: ContainerSpec) -> Result<Arc<Container>> {
        let uid = self.uid_pool.acquire()?;

        let network = match self.network_pool.acquire() {
            Ok(network) => network,
            Err(err) => {
                self.uid_pool.release(uid);
                return Err(err);
            }
        };

        let id = self.next_id().await?;
        let container_path = self.config.depot_path.join(&id);

        let handle = if spec.handle.is_empty() {
            id.clone()
        } else {
            spec.handle.clone()
        };

        info!(%id, %handle, uid, network = %network, "creating container");

        let container = Container::new(
            id.clone(),
            handle,
            &container_path,
            spec.properties.clone(),
            spec.grace_time,
            Resources::new(uid, network, Vec::new()),
            self.port_pool.clone(),
            self.runner.clone(),
            Arc::new(FsCgroupsManager::new(&self.config.cgroup_root, &id)),
            self.quota.clone(),
            Arc::new(ScriptBandwidthManager::new(
                &container_path,
                self.runner.clone(),
            )),
        );

        let create = Command::new(self.config.bin_path.join("create.sh"))
            .arg(container_path.to_string_lossy())
            .env("id", &id)
            .env("rootfs_path", self.config.rootfs_path.to_string_lossy())
            .env("user_uid", uid.to_string())
            .env("network_host_ip", network.host_ip().to_string())
            .env("network_container_ip", network.container_ip().to_string())
            .env("PATH", SCRIPT_PATH);

        if let Err(err) = self.runner.run(create).await {
            self.uid_pool.release(uid);
            self.network_pool.release(&network);
            return Err(err);
        }

        if let Err(err) = write_bind_mounts(&container_path, &spec.bind_mounts).await {
            self.uid_pool.release(uid);
            self.network_pool.release(&network);
            if let Err(destroy_err) = self.run_destroy(&id).await {
                warn!(%id, %destroy_err, "destroy after failed bind mount write also failed");
            }
            return Err(err);
        }

        Ok(container)
    }

    /// Rebuilds a container from a snapshot byte stream, reserving the
    /// exact resources it names.
    pub async fn restore(&self, snapshot: &[u8]) -> Result<Arc<Container>> {
        let snapshot: ContainerSnapshot = serde_json::from_slice(snapshot)?;

        let id = snapshot.id.clone();
        info!(%id, "restoring container from snapshot");

        let resources = &snapshot.resources;

        self.uid_pool.remove(resources.uid)?;

        if let Err(err) = self.network_pool.remove(&resources.network) {
            self.uid_pool.release(resources.uid);
            return Err(err);
        }

        for (index, port) in resources.ports.iter().enumerate() {
            if let Err(err) = self.port_pool.remove(*port) {
                self.uid_pool.release(resources.uid);
                self.network_pool.release(&resources.network);
                for port in &resources.ports[..index] {
                    self.port_pool.release(*port);
                }
                return Err(err);
            }
        }

        let container_path = self.config.depot_path.join(&id);

        let container = Container::new(
            id.clone(),
            snapshot.handle.clone(),
            &container_path,
            snapshot.properties.clone(),
            snapshot.grace_time,
            Resources::new(
                resources.uid,
                resources.network,
                resources.ports.clone(),
            ),
            self.port_pool.clone(),
            self.runner.clone(),
            Arc::new(FsCgroupsManager::new(&self.config.cgroup_root, &id)),
            self.quota.clone(),
            Arc::new(ScriptBandwidthManager::new(
                &container_path,
                self.runner.clone(),
            )),
        );

        container.restore(snapshot).await?;

        Ok(container)
    }

    /// Destroys a container and returns its resources to the pools.
    ///
    /// If the destroy script fails the resources stay out of circulation:
    /// they may still be bound on the host, and the caller retries.
    pub async fn destroy(&self, container: &Container) -> Result<()> {
        self.run_destroy(container.id()).await?;

        let resources = container.resources();
        for port in resources.ports {
            self.port_pool.release(port);
        }
        self.uid_pool.release(resources.uid);
        self.network_pool.release(&resources.network);

        info!(id = %container.id(), "container destroyed");
        Ok(())
    }

    async fn run_destroy(&self, id: &str) -> Result<()> {
        let command = Command::new(self.config.bin_path.join("destroy.sh"))
            .arg(self.config.depot_path.join(id).to_string_lossy());
        self.runner.run(command).await?;
        Ok(())
    }

    async fn next_id(&self) -> Result<String> {
        self.ids
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::Io(std::io::Error::other("container ID generator stopped")))
    }
}

// =============================================================================
// ID Generation
// =============================================================================

async fn generate_ids(seed: u64, tx: mpsc::Sender<String>) {
    let mut counter = seed;
    loop {
        let id = format_container_id(counter);
        counter = counter.wrapping_add(1);
        if tx.send(id).await.is_err() {
            break;
        }
    }
}

/// Renders a counter as 11 base-32 digits from bits 55..0.
fn format_container_id(counter: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuv";

    (0..CONTAINER_ID_DIGITS)
        .map(|i| {
            let shift = 55 - (i + 1) * 5;
            DIGITS[((counter >> shift) & 0x1f) as usize] as char
        })
        .collect()
}

// =============================================================================
// Bind Mounts
// =============================================================================

/// Appends mount commands to the container's pre-pivot hook script.
///
/// Four lines per mount: a blank separator, `mkdir -p`, the bind mount,
/// and a remount pinning the writability mode.
async fn write_bind_mounts(container_path: &Path, bind_mounts: &[BindMount]) -> Result<()> {
    if bind_mounts.is_empty() {
        return Ok(());
    }

    let mut text = String::new();
    for mount in bind_mounts {
        let dst = join_under(&container_path.join("mnt"), &mount.dst_path);
        let src = match mount.origin {
            BindMountOrigin::Host => PathBuf::from(&mount.src_path),
            BindMountOrigin::Container => {
                join_under(&container_path.join("tmp/rootfs"), &mount.src_path)
            }
        };
        let mode = mount.mode.as_option();

        text.push('\n');
        text.push_str(&format!("mkdir -p {}\n", dst.display()));
        text.push_str(&format!(
            "mount -n --bind {} {}\n",
            src.display(),
            dst.display()
        ));
        text.push_str(&format!(
            "mount -n --bind -o remount,{} {} {}\n",
            mode,
            src.display(),
            dst.display()
        ));
    }

    let hook = container_path.join("lib/hook-child-before-pivot.sh");
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&hook)
        .await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await?;

    Ok(())
}

/// Joins a possibly absolute path beneath a root.
fn join_under(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_id_is_11_base32_digits() {
        assert_eq!(format_container_id(0), "00000000000");
        assert_eq!(format_container_id(1), "00000000001");
        assert_eq!(format_container_id(31), "0000000000v");
        assert_eq!(format_container_id(32), "00000000010");
    }

    #[test]
    fn test_container_id_window_covers_55_low_bits() {
        // The 11 five-bit digits slice bits 54..0; higher bits are
        // dropped entirely.
        assert_eq!(format_container_id(1 << 55), "00000000000");
        assert_eq!(format_container_id(1 << 54), "g0000000000");
    }

    #[test]
    fn test_consecutive_counters_yield_distinct_ids() {
        let a = format_container_id(1_234_567_890);
        let b = format_container_id(1_234_567_891);
        assert_ne!(a, b);
        assert_eq!(a.len(), CONTAINER_ID_DIGITS);
    }

    #[test]
    fn test_join_under_keeps_absolute_paths_inside_root() {
        assert_eq!(
            join_under(Path::new("/depot/some-id/mnt"), "/some/dst"),
            PathBuf::from("/depot/some-id/mnt/some/dst")
        );
        assert_eq!(
            join_under(Path::new("/depot/some-id/mnt"), "relative"),
            PathBuf::from("/depot/some-id/mnt/relative")
        );
    }
}
