//! # boxpool
//!
//! **Single-Host Container Management Backend**
//!
//! This crate is the core of a long-running service that provisions,
//! tracks, persists, and destroys lightweight OS-level containers on one
//! Linux host. Each container is an isolated execution environment with
//! its own user namespace, network namespace, root filesystem, cgroup
//! subtree, and a lifetime of exec'd processes.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                            Backend                                 │
//! │      handle → Container registry, start/stop lifecycle,           │
//! │      snapshot directory (tempfile + rename persistence)           │
//! ├────────────────────────────────────────────────────────────────────┤
//! │                          ContainerPool                             │
//! │   UID / /30-subnet / port pools │ base-32 ID generator task        │
//! │   failure-atomic create │ exact-resource restore │ prune          │
//! ├────────────────────────────────────────────────────────────────────┤
//! │                           Container                                │
//! │   born → active → stopped │ event log │ limits + OOM notifier      │
//! │   net-in/net-out rules │ iomux process supervision + re-attach     │
//! │   tar streams through wsh │ snapshot/restore                       │
//! ├────────────────────────────────────────────────────────────────────┤
//! │                        CommandRunner seam                          │
//! │   setup.sh create.sh destroy.sh start.sh stop.sh net.sh            │
//! │   iomux-spawn iomux-link wsh oom quota.sh net_rate.sh              │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every isolation primitive is an external executable invoked through
//! the [`command::CommandRunner`] capability, so the entire core runs
//! against the fakes in [`testing`] without namespaces, cgroups, or root.
//!
//! # Lifecycle
//!
//! ```text
//!   setup → start (restore snapshots, prune orphans) → serve
//!   stop  → cleanup + snapshot every container
//! ```
//!
//! A container's state machine is monotonic: `born → active → stopped`,
//! with OOM forcing the final transition. On shutdown each container
//! serializes its complete live state (identity, resources, limits,
//! network rules, process IDs, event log); on the next start the pool
//! re-acquires exactly the same resources and re-binds supervision to the
//! processes still running inside the container.
//!
//! # Example
//!
//! ```rust,ignore
//! use boxpool::{
//!     Backend, ContainerPool, ContainerPoolConfig, ContainerSpec,
//!     HostSystemInfo, NetworkPool, PortPool, ProcessRunner,
//!     ScriptQuotaManager, UidPool,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> boxpool::Result<()> {
//!     let runner = Arc::new(ProcessRunner::new());
//!     let quota = Arc::new(ScriptQuotaManager::new(
//!         "/opt/backend/bin", "/var/backend/depot", true, runner.clone(),
//!     ));
//!
//!     let pool = Arc::new(ContainerPool::new(
//!         ContainerPoolConfig {
//!             bin_path: "/opt/backend/bin".into(),
//!             depot_path: "/var/backend/depot".into(),
//!             rootfs_path: "/var/backend/rootfs".into(),
//!             ..ContainerPoolConfig::default()
//!         },
//!         Arc::new(UidPool::new(10000, 256)),
//!         Arc::new(NetworkPool::new("10.254.0.0/22")?),
//!         Arc::new(PortPool::new(61000, 256)),
//!         runner,
//!         quota,
//!     ));
//!
//!     let backend = Backend::new(
//!         pool,
//!         Arc::new(HostSystemInfo::new("/var/backend/depot")),
//!         Some("/var/backend/snapshots".into()),
//!     );
//!
//!     backend.setup().await?;
//!     backend.start().await?;
//!
//!     let container = backend.create(ContainerSpec::default()).await?;
//!     let (host_port, _) = container.net_in(0, 8080).await?;
//!     println!("{} reachable on host port {}", container.handle(), host_port);
//!
//!     backend.stop().await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod bandwidth;
pub mod cgroups;
pub mod command;
pub mod constants;
pub mod container;
pub mod error;
pub mod limits;
pub mod pool;
pub mod pools;
pub mod quota;
pub mod spec;
pub mod system_info;
pub mod testing;

pub use backend::{Backend, Capacity};
pub use bandwidth::{BandwidthManager, ScriptBandwidthManager};
pub use cgroups::{CgroupsManager, FsCgroupsManager};
pub use command::{Command, CommandRunner, ExitStatus, ProcessRunner, Signal};
pub use container::{
    Container, ContainerInfo, ContainerSnapshot, ProcessStream, ProcessStreamReceiver, Resources,
    State, StreamSource,
};
pub use error::{Error, Result};
pub use limits::{
    BandwidthLimits, BandwidthStat, CpuLimits, CpuStat, DiskLimits, DiskStat, MemoryLimits,
    MemoryStat, ResourceLimits,
};
pub use pool::{ContainerPool, ContainerPoolConfig};
pub use pools::{Network, NetworkPool, PortAllocator, PortPool, SubnetAllocator, UidAllocator, UidPool};
pub use quota::{QuotaManager, ScriptQuotaManager};
pub use spec::{
    BindMount, BindMountMode, BindMountOrigin, ContainerSpec, EnvironmentVariable, ProcessSpec,
    Properties,
};
pub use system_info::{HostSystemInfo, SystemInfo};
