//! The per-container state machine.
//!
//! A container is born holding a resource triple (user ID, /30 subnet,
//! port list) and a directory of isolation scripts. Everything it does to
//! the outside world goes through those scripts or through its cgroup
//! subtree; everything it remembers (state, events, rules, limits, process
//! table) lives here and is serializable to a [`ContainerSnapshot`].
//!
//! # State machine
//!
//! ```text
//!   born ──start──▶ active ──stop / OOM──▶ stopped
//! ```
//!
//! Transitions are monotonic. A failed start leaves the container born; a
//! failed stop leaves the state unchanged.
//!
//! # Locking
//!
//! Mutable state sits behind per-field locks that are never held across a
//! script invocation, so slow scripts on one container do not convoy
//! unrelated operations.

mod info;
mod process;
mod snapshot;

pub use info::ContainerInfo;
pub use process::{ProcessStream, ProcessStreamReceiver, StreamSource};
pub use snapshot::{
    ContainerSnapshot, LimitsSnapshot, NetInRule, NetOutRule, ProcessSnapshot, ResourcesSnapshot,
};

use crate::bandwidth::BandwidthManager;
use crate::cgroups::CgroupsManager;
use crate::command::{Child, Command, CommandRunner, InputStream, OutputStream, Signal, Signaller};
use crate::constants::{CONTAINER_IFACE_MTU, CONTAINER_USER, ROOT_USER, SCRIPT_PATH};
use crate::error::{Error, Result};
use crate::limits::{BandwidthLimits, CpuLimits, DiskLimits, MemoryLimits};
use crate::pools::{Network, PortAllocator};
use crate::quota::QuotaManager;
use crate::spec::{EnvironmentVariable, Properties, ProcessSpec};
use process::{FanOut, ProcessTable};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, ReadBuf};
use tracing::{debug, info, warn};

// =============================================================================
// State and Resources
// =============================================================================

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Created, not yet started.
    #[default]
    Born,
    /// Started and serving.
    Active,
    /// Stopped by request or by the OOM notifier.
    Stopped,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Born => write!(f, "born"),
            Self::Active => write!(f, "active"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// The finite host resources a container owns exclusively.
#[derive(Debug, Clone)]
pub struct Resources {
    pub uid: u32,
    pub network: Network,
    pub ports: Vec<u32>,
}

impl Resources {
    /// Bundles an acquired resource triple.
    pub fn new(uid: u32, network: Network, ports: Vec<u32>) -> Self {
        Self {
            uid,
            network,
            ports,
        }
    }
}

#[derive(Default)]
struct LimitsCache {
    memory: Option<MemoryLimits>,
    disk: Option<DiskLimits>,
    bandwidth: Option<BandwidthLimits>,
    cpu: Option<CpuLimits>,
}

impl LimitsCache {
    fn to_snapshot(&self) -> LimitsSnapshot {
        LimitsSnapshot {
            memory: self.memory,
            disk: self.disk,
            bandwidth: self.bandwidth,
            cpu: self.cpu,
        }
    }
}

// =============================================================================
// Container
// =============================================================================

/// One container instance.
///
/// Constructed by the pool, registered by handle in the backend, and
/// shared with supervision tasks; hence always behind an `Arc`.
pub struct Container {
    id: String,
    handle: String,
    path: PathBuf,
    grace_time: Duration,
    properties: Properties,

    state: Mutex<State>,
    events: Mutex<Vec<String>>,
    resources: Mutex<Resources>,
    limits: Mutex<LimitsCache>,
    net_ins: Mutex<Vec<NetInRule>>,
    net_outs: Mutex<Vec<NetOutRule>>,

    processes: Arc<ProcessTable>,
    oom: tokio::sync::Mutex<Option<Arc<dyn Signaller>>>,

    port_pool: Arc<dyn PortAllocator>,
    runner: Arc<dyn CommandRunner>,
    cgroups: Arc<dyn CgroupsManager>,
    quota: Arc<dyn QuotaManager>,
    bandwidth: Arc<dyn BandwidthManager>,

    myself: Weak<Container>,
}

impl Container {
    /// Creates a container around an already-acquired resource triple.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        handle: impl Into<String>,
        container_path: impl Into<PathBuf>,
        properties: Properties,
        grace_time: Duration,
        resources: Resources,
        port_pool: Arc<dyn PortAllocator>,
        runner: Arc<dyn CommandRunner>,
        cgroups: Arc<dyn CgroupsManager>,
        quota: Arc<dyn QuotaManager>,
        bandwidth: Arc<dyn BandwidthManager>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|myself| Self {
            id: id.into(),
            handle: handle.into(),
            path: container_path.into(),
            grace_time,
            properties,
            state: Mutex::new(State::Born),
            events: Mutex::new(Vec::new()),
            resources: Mutex::new(resources),
            limits: Mutex::new(LimitsCache::default()),
            net_ins: Mutex::new(Vec::new()),
            net_outs: Mutex::new(Vec::new()),
            processes: ProcessTable::new(),
            oom: tokio::sync::Mutex::new(None),
            port_pool,
            runner,
            cgroups,
            quota,
            bandwidth,
            myself: myself.clone(),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn container_path(&self) -> &Path {
        &self.path
    }

    pub fn grace_time(&self) -> Duration {
        self.grace_time
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn state(&self) -> State {
        *self.state.lock().expect("state lock")
    }

    /// The event log so far, oldest first.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("events lock").clone()
    }

    /// The resource triple currently held.
    pub fn resources(&self) -> Resources {
        self.resources.lock().expect("resources lock").clone()
    }

    /// True when every filter pair is present in this container's
    /// properties.
    pub fn has_properties(&self, filter: &Properties) -> bool {
        filter
            .iter()
            .all(|(key, value)| self.properties.get(key) == Some(value))
    }

    fn note_event(&self, event: &str) {
        info!(id = %self.id, event, "container event");
        self.events
            .lock()
            .expect("events lock")
            .push(event.to_string());
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Runs the container's start script and transitions to active.
    pub async fn start(&self) -> Result<()> {
        let command = Command::new(self.path.join("start.sh"))
            .env("id", &self.id)
            .env("container_iface_mtu", CONTAINER_IFACE_MTU.to_string())
            .env("PATH", SCRIPT_PATH);

        self.runner.run(command).await?;

        *self.state.lock().expect("state lock") = State::Active;
        info!(id = %self.id, "container started");
        Ok(())
    }

    /// Runs the stop script (`-w 0` to kill immediately), silences the OOM
    /// notifier, and transitions to stopped.
    pub async fn stop(&self, kill: bool) -> Result<()> {
        let mut command = Command::new(self.path.join("stop.sh"));
        if kill {
            command = command.args(["-w", "0"]);
        }

        self.runner.run(command).await?;
        self.stop_oom_notifier().await;

        *self.state.lock().expect("state lock") = State::Stopped;
        info!(id = %self.id, kill, "container stopped");
        Ok(())
    }

    /// Releases supervision without destroying anything on disk.
    ///
    /// Idempotent. Silences the OOM notifier and interrupts every stream
    /// relay so attached receivers observe their terminal chunk and close.
    pub async fn cleanup(&self) {
        self.stop_oom_notifier().await;
        self.processes.interrupt_all();
    }

    // =========================================================================
    // Limits
    // =========================================================================

    /// Applies a memory ceiling and arms the OOM notifier.
    pub async fn limit_memory(&self, limits: MemoryLimits) -> Result<()> {
        self.start_oom_notifier().await?;

        let value = limits.limit_in_bytes.to_string();

        // The kernel requires memsw >= memory, and memsw may be absent on
        // kernels without swap accounting. Writing memory, memsw, memory
        // lets the limit move in either direction; only the last memory
        // write is load-bearing.
        if let Err(err) = self.cgroups.set("memory", "memory.limit_in_bytes", &value).await {
            debug!(id = %self.id, %err, "first memory limit write failed, retrying after memsw");
        }
        if let Err(err) = self
            .cgroups
            .set("memory", "memory.memsw.limit_in_bytes", &value)
            .await
        {
            debug!(id = %self.id, %err, "memsw limit not applied");
        }
        self.cgroups
            .set("memory", "memory.limit_in_bytes", &value)
            .await?;

        self.limits.lock().expect("limits lock").memory = Some(limits);
        Ok(())
    }

    /// Reads the enforced memory limit from the cgroup.
    pub async fn current_memory_limits(&self) -> Result<MemoryLimits> {
        let raw = self.cgroups.get("memory", "memory.limit_in_bytes").await?;
        let limit_in_bytes = raw.trim().parse().map_err(|_| Error::MalformedOutput {
            origin: "memory.limit_in_bytes".to_string(),
            detail: raw.clone(),
        })?;
        Ok(MemoryLimits { limit_in_bytes })
    }

    /// Applies a CPU share weight.
    pub async fn limit_cpu(&self, limits: CpuLimits) -> Result<()> {
        self.cgroups
            .set("cpu", "cpu.shares", &limits.limit_in_shares.to_string())
            .await?;
        self.limits.lock().expect("limits lock").cpu = Some(limits);
        Ok(())
    }

    /// Reads the enforced CPU shares from the cgroup.
    pub async fn current_cpu_limits(&self) -> Result<CpuLimits> {
        let raw = self.cgroups.get("cpu", "cpu.shares").await?;
        let limit_in_shares = raw.trim().parse().map_err(|_| Error::MalformedOutput {
            origin: "cpu.shares".to_string(),
            detail: raw.clone(),
        })?;
        Ok(CpuLimits { limit_in_shares })
    }

    /// Applies a disk quota keyed on the container's user.
    pub async fn limit_disk(&self, limits: DiskLimits) -> Result<()> {
        let uid = self.resources.lock().expect("resources lock").uid;
        self.quota.set_limits(uid, &limits).await?;
        self.limits.lock().expect("limits lock").disk = Some(limits);
        Ok(())
    }

    /// Queries the quota subsystem for the enforced disk limits.
    pub async fn current_disk_limits(&self) -> Result<DiskLimits> {
        let uid = self.resources.lock().expect("resources lock").uid;
        self.quota.get_limits(uid).await
    }

    /// Applies a traffic-shaping rate.
    pub async fn limit_bandwidth(&self, limits: BandwidthLimits) -> Result<()> {
        self.bandwidth.set_limits(&limits).await?;
        self.limits.lock().expect("limits lock").bandwidth = Some(limits);
        Ok(())
    }

    /// The last successfully applied bandwidth limit, or zero.
    pub fn current_bandwidth_limits(&self) -> BandwidthLimits {
        self.limits
            .lock()
            .expect("limits lock")
            .bandwidth
            .unwrap_or_default()
    }

    async fn start_oom_notifier(&self) -> Result<()> {
        let mut slot = self.oom.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let cgroup_path = self.cgroups.subsystem_path("memory");
        let command = Command::new(self.path.join("bin/oom"))
            .arg(cgroup_path.to_string_lossy());

        let child = self.runner.spawn(command).await?;
        *slot = Some(child.signaller());

        let container = self.myself.clone();
        tokio::spawn(async move {
            // Exit 0 means the memory cgroup fired OOM; anything else is
            // the notifier being torn down.
            let oomed = matches!(child.wait().await, Ok(status) if status.success());
            if !oomed {
                return;
            }
            if let Some(container) = container.upgrade() {
                container.note_event("out of memory");
                if let Err(err) = container.stop(false).await {
                    warn!(id = %container.id, %err, "failed to stop container after OOM");
                }
            }
        });

        Ok(())
    }

    async fn stop_oom_notifier(&self) {
        if let Some(signaller) = self.oom.lock().await.as_ref() {
            signaller.signal(Signal::Kill);
        }
    }

    // =========================================================================
    // Network Rules
    // =========================================================================

    /// Maps a host port to a container port.
    ///
    /// A zero host port draws one from the port pool and adds it to the
    /// container's owned ports; a zero container port defaults to the host
    /// port.
    pub async fn net_in(&self, host_port: u32, container_port: u32) -> Result<(u32, u32)> {
        let host_port = if host_port == 0 {
            let port = self.port_pool.acquire()?;
            self.resources
                .lock()
                .expect("resources lock")
                .ports
                .push(port);
            port
        } else {
            host_port
        };

        let container_port = if container_port == 0 {
            host_port
        } else {
            container_port
        };

        let command = Command::new(self.path.join("net.sh"))
            .arg("in")
            .env("HOST_PORT", host_port.to_string())
            .env("CONTAINER_PORT", container_port.to_string());
        self.runner.run(command).await?;

        self.net_ins.lock().expect("net-ins lock").push(NetInRule {
            host_port,
            container_port,
        });

        Ok((host_port, container_port))
    }

    /// Allows outbound traffic to a network and/or port.
    pub async fn net_out(&self, network: &str, port: u32) -> Result<()> {
        if network.is_empty() && port == 0 {
            return Err(Error::InvalidNetOut);
        }

        let port_value = if port == 0 {
            String::new()
        } else {
            port.to_string()
        };

        let command = Command::new(self.path.join("net.sh"))
            .arg("out")
            .env("NETWORK", network)
            .env("PORT", port_value);
        self.runner.run(command).await?;

        self.net_outs.lock().expect("net-outs lock").push(NetOutRule {
            network: network.to_string(),
            port,
        });

        Ok(())
    }

    // =========================================================================
    // Processes
    // =========================================================================

    /// Runs a script inside the container under out-of-band supervision.
    ///
    /// Returns the new process ID and a stream of output chunks. The
    /// process outlives the returned receiver; other callers can join via
    /// [`Container::attach`] until the terminal chunk is emitted.
    pub async fn run(&self, spec: ProcessSpec) -> Result<(u32, ProcessStreamReceiver)> {
        let user = if spec.privileged {
            ROOT_USER
        } else {
            CONTAINER_USER
        };

        let process_id = self.processes.allocate_id();
        let process_dir = self.process_dir(process_id);
        let spawn_path = self.path.join("bin/iomux-spawn");

        let command = Command::new(&spawn_path)
            .arg(process_dir.to_string_lossy())
            .arg(self.path.join("bin/wsh").to_string_lossy())
            .arg("--socket")
            .arg(self.wshd_socket().to_string_lossy())
            .arg("--user")
            .arg(user)
            .arg("/bin/bash")
            .envs(spec.limits.to_env())
            .stdin(render_exec_script(&spec.env, &spec.script));

        let mut child = self.runner.spawn(command).await?;
        let stdout = child.take_stdout().ok_or_else(|| Error::ProcessNotActive {
            path: spawn_path.clone(),
        })?;
        wait_for_active(stdout, &spawn_path).await?;

        debug!(id = %self.id, process_id, user, "process spawned");

        let fan_out = FanOut::new();
        let receiver = fan_out.subscribe();
        self.processes.insert_running(process_id, fan_out.clone());
        process::supervise(
            self.runner.clone(),
            self.link_command(process_id),
            self.processes.clone(),
            process_id,
            fan_out,
        );

        Ok((process_id, receiver))
    }

    /// Re-joins the output stream of a running process.
    pub fn attach(&self, process_id: u32) -> Result<ProcessStreamReceiver> {
        self.processes.attach(process_id)
    }

    fn process_dir(&self, process_id: u32) -> PathBuf {
        self.path.join("processes").join(process_id.to_string())
    }

    fn wshd_socket(&self) -> PathBuf {
        self.path.join("run/wshd.sock")
    }

    fn link_command(&self, process_id: u32) -> Command {
        let process_dir = self.process_dir(process_id);
        Command::new(self.path.join("bin/iomux-link"))
            .arg("-w")
            .arg(process_dir.join("cursors").to_string_lossy())
            .arg(process_dir.to_string_lossy())
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// Opens a tar stream into a directory inside the container.
    ///
    /// Bytes written are extracted under `dst_path`; closing the writer
    /// waits for the extraction and surfaces its exit status.
    pub async fn stream_in(&self, dst_path: &str) -> Result<StreamInWriter> {
        let wsh_path = self.path.join("bin/wsh");
        let script = format!("mkdir -p {dst_path} && tar xf - -C {dst_path}");

        let command = Command::new(&wsh_path)
            .arg("--socket")
            .arg(self.wshd_socket().to_string_lossy())
            .arg("--user")
            .arg(CONTAINER_USER)
            .arg("bash")
            .arg("-c")
            .arg(script);

        let mut child = self.runner.spawn(command).await?;
        let stdin = child.take_stdin().ok_or_else(|| {
            Error::Io(std::io::Error::other("stream-in stdin unavailable"))
        })?;

        Ok(StreamInWriter {
            stdin: Some(stdin),
            child: Some(child),
            path: wsh_path,
        })
    }

    /// Opens a tar stream of a path inside the container.
    ///
    /// A trailing slash streams the directory's contents rather than the
    /// directory itself.
    pub async fn stream_out(&self, src_path: &str) -> Result<StreamOutReader> {
        let (parent, base) = tar_source(src_path);

        let command = Command::new(self.path.join("bin/wsh"))
            .arg("--socket")
            .arg(self.wshd_socket().to_string_lossy())
            .arg("--user")
            .arg(CONTAINER_USER)
            .args(["tar", "cf", "-", "-C"])
            .arg(parent)
            .arg(base);

        let mut child = self.runner.spawn(command).await?;
        let stdout = child.take_stdout().ok_or_else(|| {
            Error::Io(std::io::Error::other("stream-out stdout unavailable"))
        })?;

        Ok(StreamOutReader {
            _child: child,
            stdout,
        })
    }

    // =========================================================================
    // Snapshot / Restore
    // =========================================================================

    /// Captures the container's complete live state.
    ///
    /// Purely a read of in-memory state; the container keeps running.
    pub fn snapshot(&self) -> ContainerSnapshot {
        let resources = self.resources.lock().expect("resources lock");

        ContainerSnapshot {
            id: self.id.clone(),
            handle: self.handle.clone(),
            grace_time: self.grace_time,
            state: *self.state.lock().expect("state lock"),
            events: self.events.lock().expect("events lock").clone(),
            resources: ResourcesSnapshot {
                uid: resources.uid,
                network: resources.network,
                ports: resources.ports.clone(),
            },
            limits: self.limits.lock().expect("limits lock").to_snapshot(),
            net_ins: self.net_ins.lock().expect("net-ins lock").clone(),
            net_outs: self.net_outs.lock().expect("net-outs lock").clone(),
            processes: self
                .processes
                .running_ids()
                .into_iter()
                .map(|id| ProcessSnapshot { id })
                .collect(),
            properties: self.properties.clone(),
        }
    }

    /// Rebinds this container to the state a snapshot describes.
    ///
    /// Re-establishes supervision of in-flight processes, replays network
    /// rules, and re-enforces the memory limit. The first script failure
    /// aborts; changes already applied are not rolled back.
    pub async fn restore(&self, snapshot: ContainerSnapshot) -> Result<()> {
        info!(id = %self.id, "restoring container");

        *self.state.lock().expect("state lock") = snapshot.state;
        *self.events.lock().expect("events lock") = snapshot.events;
        {
            let mut limits = self.limits.lock().expect("limits lock");
            limits.memory = snapshot.limits.memory;
            limits.disk = snapshot.limits.disk;
            limits.bandwidth = snapshot.limits.bandwidth;
            limits.cpu = snapshot.limits.cpu;
        }

        for process in &snapshot.processes {
            let fan_out = FanOut::new();
            self.processes.insert_running(process.id, fan_out.clone());
            self.processes.reserve_through(process.id);
            process::supervise(
                self.runner.clone(),
                self.link_command(process.id),
                self.processes.clone(),
                process.id,
                fan_out,
            );
        }

        self.runner
            .run(Command::new(self.path.join("net.sh")).arg("setup"))
            .await?;

        for rule in snapshot.net_ins {
            let command = Command::new(self.path.join("net.sh"))
                .arg("in")
                .env("HOST_PORT", rule.host_port.to_string())
                .env("CONTAINER_PORT", rule.container_port.to_string());
            self.runner.run(command).await?;
            self.net_ins.lock().expect("net-ins lock").push(rule);
        }

        for rule in snapshot.net_outs {
            let port_value = if rule.port == 0 {
                String::new()
            } else {
                rule.port.to_string()
            };
            let command = Command::new(self.path.join("net.sh"))
                .arg("out")
                .env("NETWORK", rule.network.clone())
                .env("PORT", port_value);
            self.runner.run(command).await?;
            self.net_outs.lock().expect("net-outs lock").push(rule);
        }

        if let Some(memory) = snapshot.limits.memory {
            self.limit_memory(memory).await?;
        }

        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Reports the container's live state, accounting, and rules.
    pub async fn info(&self) -> Result<ContainerInfo> {
        let memory_stat =
            info::parse_memory_stat(&self.cgroups.get("memory", "memory.stat").await?);

        let usage_raw = self.cgroups.get("cpuacct", "cpuacct.usage").await?;
        let usage = usage_raw
            .trim()
            .parse()
            .map_err(|_| Error::MalformedOutput {
                origin: "cpuacct.usage".to_string(),
                detail: usage_raw.clone(),
            })?;
        let (user, system) =
            info::parse_cpuacct_stat(&self.cgroups.get("cpuacct", "cpuacct.stat").await?);

        let (uid, network) = {
            let resources = self.resources.lock().expect("resources lock");
            (resources.uid, resources.network)
        };

        let disk_stat = self.quota.get_usage(uid).await?;
        let bandwidth_stat = self.bandwidth.get_stats().await?;

        Ok(ContainerInfo {
            state: self.state(),
            events: self.events(),
            properties: self.properties.clone(),
            container_path: self.path.clone(),
            host_ip: network.host_ip().to_string(),
            container_ip: network.container_ip().to_string(),
            process_ids: self.processes.running_ids(),
            memory_stat,
            cpu_stat: crate::limits::CpuStat {
                usage,
                user,
                system,
            },
            disk_stat,
            bandwidth_stat,
        })
    }
}

// =============================================================================
// Stream Handles
// =============================================================================

/// Writer half of a stream-in operation.
pub struct StreamInWriter {
    stdin: Option<InputStream>,
    child: Option<Box<dyn Child>>,
    path: PathBuf,
}

impl StreamInWriter {
    /// Writes archive bytes into the container.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Io(std::io::Error::other("stream already closed")))?;
        stdin.write_all(data).await?;
        Ok(())
    }

    /// Closes the stream and waits for the in-container extraction.
    pub async fn close(mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.shutdown().await?;
        }

        if let Some(child) = self.child.take() {
            let status = child.wait().await?;
            if !status.success() {
                return Err(Error::ScriptFailed {
                    path: self.path.clone(),
                    status: status.code().unwrap_or(-1),
                });
            }
        }

        Ok(())
    }
}

/// Reader half of a stream-out operation.
///
/// Keeps the in-container archiver alive for as long as the reader is
/// held.
pub struct StreamOutReader {
    _child: Box<dyn Child>,
    stdout: OutputStream,
}

impl AsyncRead for StreamOutReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Renders the stdin script handed to the process supervisor.
///
/// Values land inside double quotes with embedded `"` escaped; `$` and
/// newlines pass through to the shell untouched.
fn render_exec_script(env: &[EnvironmentVariable], script: &str) -> String {
    let mut lines: Vec<String> = env
        .iter()
        .map(|var| format!("export {}=\"{}\"", var.key, var.value.replace('"', "\\\"")))
        .collect();
    lines.push(script.to_string());
    lines.join("\n")
}

async fn wait_for_active(stdout: OutputStream, path: &Path) -> Result<()> {
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await? {
        if line == "active" {
            return Ok(());
        }
    }

    Err(Error::ProcessNotActive {
        path: path.to_path_buf(),
    })
}

fn tar_source(src_path: &str) -> (String, String) {
    if src_path.ends_with('/') {
        return (src_path.to_string(), ".".to_string());
    }

    match src_path.rfind('/') {
        Some(0) => ("/".to_string(), src_path[1..].to_string()),
        Some(idx) => (src_path[..idx].to_string(), src_path[idx + 1..].to_string()),
        None => (".".to_string(), src_path.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_exec_script_escapes_quotes_only() {
        let env = vec![
            EnvironmentVariable::new("ESCAPED", "kurt \"russell\""),
            EnvironmentVariable::new("INTERPOLATED", "snake $PLISSKEN"),
            EnvironmentVariable::new("UNESCAPED", "isaac\nhayes"),
        ];

        assert_eq!(
            render_exec_script(&env, "/some/script"),
            "export ESCAPED=\"kurt \\\"russell\\\"\"\n\
             export INTERPOLATED=\"snake $PLISSKEN\"\n\
             export UNESCAPED=\"isaac\nhayes\"\n\
             /some/script"
        );
    }

    #[test]
    fn test_render_exec_script_without_env() {
        assert_eq!(render_exec_script(&[], "/some/script"), "/some/script");
    }

    #[test]
    fn test_tar_source_splits_parent_and_base() {
        assert_eq!(
            tar_source("/some/directory/dst"),
            ("/some/directory".to_string(), "dst".to_string())
        );
        assert_eq!(tar_source("/dst"), ("/".to_string(), "dst".to_string()));
        assert_eq!(tar_source("dst"), (".".to_string(), "dst".to_string()));
    }

    #[test]
    fn test_tar_source_trailing_slash_streams_contents() {
        assert_eq!(
            tar_source("/some/directory/dst/"),
            ("/some/directory/dst/".to_string(), ".".to_string())
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(State::Born.to_string(), "born");
        assert_eq!(State::Active.to_string(), "active");
        assert_eq!(State::Stopped.to_string(), "stopped");
    }
}
