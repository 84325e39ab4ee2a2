//! Test doubles for the script-driven collaborators.
//!
//! The backend's only side-effect channels are the [`CommandRunner`], the
//! cgroup accessor, and the quota/bandwidth managers. The fakes here
//! record every interaction and let tests script child-process behavior
//! (output, exit status, signal handling) without touching the host, so
//! the entire core is exercisable on any machine.
//!
//! The fake runner's children are real async pipes: a scripted hook gets
//! a [`FakeProcess`] with writable stdout/stderr, readable stdin, a
//! signal receiver, and an exit-status setter, and runs on its own task
//! exactly like a real child would.

use crate::bandwidth::BandwidthManager;
use crate::cgroups::CgroupsManager;
use crate::command::{
    Child, Command, CommandRunner, ExitStatus, InputStream, OutputStream, Signal, Signaller,
};
use crate::error::{Error, Result};
use crate::limits::{BandwidthLimits, BandwidthStat, DiskLimits, DiskStat};
use crate::pools::{Network, PortAllocator, SubnetAllocator, UidAllocator};
use crate::quota::QuotaManager;
use async_trait::async_trait;
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};

/// Pipe capacity for fake child stdio.
const FAKE_PIPE_CAPACITY: usize = 64 * 1024;

fn script_error(path: impl Into<PathBuf>) -> Error {
    Error::ScriptFailed {
        path: path.into(),
        status: 1,
    }
}

// =============================================================================
// Command Matching
// =============================================================================

/// Matches commands by path suffix and argument prefix.
#[derive(Debug, Clone, Default)]
pub struct CommandPattern {
    path_suffix: String,
    args_prefix: Vec<String>,
}

impl CommandPattern {
    /// Matches any invocation of an executable whose path ends with
    /// `suffix`.
    pub fn path(suffix: impl Into<String>) -> Self {
        Self {
            path_suffix: suffix.into(),
            args_prefix: Vec::new(),
        }
    }

    /// Additionally requires the leading arguments to match.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args_prefix = args.into_iter().map(Into::into).collect();
        self
    }

    fn matches(&self, command: &Command) -> bool {
        command
            .path
            .to_string_lossy()
            .ends_with(&self.path_suffix)
            && command.args.len() >= self.args_prefix.len()
            && command.args[..self.args_prefix.len()] == self.args_prefix[..]
    }
}

// =============================================================================
// Fake Command Runner
// =============================================================================

type RunHook = Arc<dyn Fn(&Command) -> Result<Vec<u8>> + Send + Sync>;
type SpawnHook =
    Arc<dyn Fn(FakeProcess) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// [`CommandRunner`] that records invocations and runs scripted children.
#[derive(Default)]
pub struct FakeCommandRunner {
    ran: Mutex<Vec<Command>>,
    spawned: Mutex<Vec<Command>>,
    signals: Arc<Mutex<Vec<(PathBuf, Signal)>>>,
    run_hooks: Mutex<Vec<(CommandPattern, RunHook)>>,
    spawn_hooks: Mutex<Vec<(CommandPattern, SpawnHook)>>,
    spawn_failures: Mutex<Vec<(CommandPattern, String)>>,
}

impl FakeCommandRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Scripts the result of matching `run` invocations. The last
    /// registered matching hook wins.
    pub fn when_running<F>(&self, pattern: CommandPattern, hook: F)
    where
        F: Fn(&Command) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.run_hooks
            .lock()
            .expect("run hooks lock")
            .push((pattern, Arc::new(hook)));
    }

    /// Shorthand for a `run` hook that fails with a script error.
    pub fn fail_when_running(&self, pattern: CommandPattern) {
        let suffix = pattern.path_suffix.clone();
        self.when_running(pattern, move |_| Err(script_error(&suffix)));
    }

    /// Scripts the behavior of matching spawned children. The hook runs
    /// on its own task with the child's pipes.
    pub fn when_spawning<F, Fut>(&self, pattern: CommandPattern, hook: F)
    where
        F: Fn(FakeProcess) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_hooks
            .lock()
            .expect("spawn hooks lock")
            .push((pattern, Arc::new(move |process| Box::pin(hook(process)))));
    }

    /// Makes matching spawn attempts fail outright.
    pub fn fail_when_spawning(&self, pattern: CommandPattern) {
        let suffix = pattern.path_suffix.clone();
        self.spawn_failures
            .lock()
            .expect("spawn failures lock")
            .push((pattern, suffix));
    }

    /// Commands run to completion, in invocation order.
    pub fn ran(&self) -> Vec<Command> {
        self.ran.lock().expect("ran lock").clone()
    }

    /// Commands run to completion whose path ends with `suffix`.
    pub fn ran_matching(&self, suffix: &str) -> Vec<Command> {
        let pattern = CommandPattern::path(suffix);
        self.ran()
            .into_iter()
            .filter(|command| pattern.matches(command))
            .collect()
    }

    /// Spawned commands, in invocation order.
    pub fn spawned(&self) -> Vec<Command> {
        self.spawned.lock().expect("spawned lock").clone()
    }

    /// Spawned commands whose path ends with `suffix`.
    pub fn spawned_matching(&self, suffix: &str) -> Vec<Command> {
        let pattern = CommandPattern::path(suffix);
        self.spawned()
            .into_iter()
            .filter(|command| pattern.matches(command))
            .collect()
    }

    /// Signals delivered to children whose path ends with `suffix`.
    pub fn signalled_matching(&self, suffix: &str) -> Vec<Signal> {
        self.signals
            .lock()
            .expect("signals lock")
            .iter()
            .filter(|(path, _)| path.to_string_lossy().ends_with(suffix))
            .map(|(_, signal)| *signal)
            .collect()
    }

    fn find_run_hook(&self, command: &Command) -> Option<RunHook> {
        self.run_hooks
            .lock()
            .expect("run hooks lock")
            .iter()
            .rev()
            .find(|(pattern, _)| pattern.matches(command))
            .map(|(_, hook)| hook.clone())
    }

    fn find_spawn_hook(&self, command: &Command) -> Option<SpawnHook> {
        self.spawn_hooks
            .lock()
            .expect("spawn hooks lock")
            .iter()
            .rev()
            .find(|(pattern, _)| pattern.matches(command))
            .map(|(_, hook)| hook.clone())
    }
}

#[async_trait]
impl CommandRunner for FakeCommandRunner {
    async fn run(&self, command: Command) -> Result<Vec<u8>> {
        self.ran.lock().expect("ran lock").push(command.clone());

        match self.find_run_hook(&command) {
            Some(hook) => hook(&command),
            None => Ok(Vec::new()),
        }
    }

    async fn spawn(&self, command: Command) -> Result<Box<dyn Child>> {
        {
            let failures = self.spawn_failures.lock().expect("spawn failures lock");
            if let Some((_, suffix)) = failures
                .iter()
                .rev()
                .find(|(pattern, _)| pattern.matches(&command))
            {
                return Err(script_error(suffix));
            }
        }

        self.spawned
            .lock()
            .expect("spawned lock")
            .push(command.clone());

        let (stdout_write, stdout_read) = tokio::io::duplex(FAKE_PIPE_CAPACITY);
        let (stderr_write, stderr_read) = tokio::io::duplex(FAKE_PIPE_CAPACITY);
        let (stdin_write, stdin_read) = tokio::io::duplex(FAKE_PIPE_CAPACITY);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let mut stdin_for_caller = Some(stdin_write);
        if let Some(data) = command.stdin.clone() {
            let mut writer = stdin_for_caller.take().expect("stdin taken twice");
            tokio::spawn(async move {
                let _ = writer.write_all(&data).await;
                let _ = writer.shutdown().await;
            });
        }

        let process = FakeProcess {
            stdout: stdout_write,
            stderr: stderr_write,
            stdin: stdin_read,
            signals: signal_rx,
            exit: Some(exit_tx),
        };

        match self.find_spawn_hook(&command) {
            Some(hook) => {
                tokio::spawn(hook(process));
            }
            None => {
                // An unscripted child exits 0 immediately with no output.
                tokio::spawn(async move {
                    let mut process = process;
                    process.exit(ExitStatus::from_code(0));
                });
            }
        }

        Ok(Box::new(FakeChild {
            path: command.path.clone(),
            stdout: Some(Box::new(stdout_read)),
            stderr: Some(Box::new(stderr_read)),
            stdin: stdin_for_caller.map(|writer| Box::new(writer) as InputStream),
            signal_tx,
            signals: self.signals.clone(),
            exit: Some(exit_rx),
        }))
    }
}

// =============================================================================
// Fake Child and Process
// =============================================================================

/// The hook-side view of a spawned fake child.
pub struct FakeProcess {
    /// Write end of the child's stdout.
    pub stdout: DuplexStream,
    /// Write end of the child's stderr.
    pub stderr: DuplexStream,
    /// Read end of the child's stdin.
    pub stdin: DuplexStream,
    /// Signals delivered by the code under test.
    pub signals: mpsc::UnboundedReceiver<Signal>,
    exit: Option<oneshot::Sender<Result<ExitStatus>>>,
}

impl FakeProcess {
    /// Reports the child's exit status. Dropping the process without
    /// calling this reports exit 0.
    pub fn exit(&mut self, status: ExitStatus) {
        if let Some(tx) = self.exit.take() {
            let _ = tx.send(Ok(status));
        }
    }

    /// Makes the waiter observe an error instead of an exit status.
    pub fn fail_wait(&mut self, error: Error) {
        if let Some(tx) = self.exit.take() {
            let _ = tx.send(Err(error));
        }
    }

    /// Waits for the next delivered signal.
    pub async fn next_signal(&mut self) -> Option<Signal> {
        self.signals.recv().await
    }
}

struct FakeChild {
    path: PathBuf,
    stdout: Option<OutputStream>,
    stderr: Option<OutputStream>,
    stdin: Option<InputStream>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    signals: Arc<Mutex<Vec<(PathBuf, Signal)>>>,
    exit: Option<oneshot::Receiver<Result<ExitStatus>>>,
}

#[async_trait]
impl Child for FakeChild {
    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.stderr.take()
    }

    fn take_stdin(&mut self) -> Option<InputStream> {
        self.stdin.take()
    }

    fn signaller(&self) -> Arc<dyn Signaller> {
        Arc::new(FakeSignaller {
            path: self.path.clone(),
            signal_tx: self.signal_tx.clone(),
            signals: self.signals.clone(),
        })
    }

    async fn wait(mut self: Box<Self>) -> Result<ExitStatus> {
        match self.exit.take() {
            Some(rx) => match rx.await {
                Ok(result) => result,
                // Hook dropped the exit sender: treat as a clean exit.
                Err(_) => Ok(ExitStatus::from_code(0)),
            },
            None => Ok(ExitStatus::from_code(0)),
        }
    }
}

struct FakeSignaller {
    path: PathBuf,
    signal_tx: mpsc::UnboundedSender<Signal>,
    signals: Arc<Mutex<Vec<(PathBuf, Signal)>>>,
}

impl Signaller for FakeSignaller {
    fn signal(&self, signal: Signal) {
        self.signals
            .lock()
            .expect("signals lock")
            .push((self.path.clone(), signal));
        let _ = self.signal_tx.send(signal);
    }
}

// =============================================================================
// Fake Cgroups
// =============================================================================

/// One recorded cgroup write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetValue {
    pub subsystem: String,
    pub name: String,
    pub value: String,
}

impl SetValue {
    pub fn new(
        subsystem: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            subsystem: subsystem.into(),
            name: name.into(),
            value: value.into(),
        }
    }
}

type CgroupSetHook = Arc<dyn Fn() -> Result<()> + Send + Sync>;
type CgroupGetHook = Arc<dyn Fn() -> Result<String> + Send + Sync>;

/// [`CgroupsManager`] recording writes and scripting reads.
pub struct FakeCgroupsManager {
    root: PathBuf,
    id: String,
    set_values: Mutex<Vec<SetValue>>,
    set_hooks: Mutex<Vec<((String, String), CgroupSetHook)>>,
    get_hooks: Mutex<Vec<((String, String), CgroupGetHook)>>,
}

impl FakeCgroupsManager {
    pub fn new(root: impl Into<PathBuf>, id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            id: id.into(),
            set_values: Mutex::new(Vec::new()),
            set_hooks: Mutex::new(Vec::new()),
            get_hooks: Mutex::new(Vec::new()),
        })
    }

    /// Intercepts writes to one control file.
    pub fn when_setting<F>(&self, subsystem: &str, name: &str, hook: F)
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.set_hooks.lock().expect("set hooks lock").push((
            (subsystem.to_string(), name.to_string()),
            Arc::new(hook),
        ));
    }

    /// Scripts reads of one control file.
    pub fn when_getting<F>(&self, subsystem: &str, name: &str, hook: F)
    where
        F: Fn() -> Result<String> + Send + Sync + 'static,
    {
        self.get_hooks.lock().expect("get hooks lock").push((
            (subsystem.to_string(), name.to_string()),
            Arc::new(hook),
        ));
    }

    /// Successful writes, in order.
    pub fn set_values(&self) -> Vec<SetValue> {
        self.set_values.lock().expect("set values lock").clone()
    }
}

#[async_trait]
impl CgroupsManager for FakeCgroupsManager {
    async fn set(&self, subsystem: &str, name: &str, value: &str) -> Result<()> {
        let hook = self
            .set_hooks
            .lock()
            .expect("set hooks lock")
            .iter()
            .rev()
            .find(|((s, n), _)| s == subsystem && n == name)
            .map(|(_, hook)| hook.clone());

        if let Some(hook) = hook {
            hook()?;
        }

        self.set_values
            .lock()
            .expect("set values lock")
            .push(SetValue::new(subsystem, name, value));
        Ok(())
    }

    async fn get(&self, subsystem: &str, name: &str) -> Result<String> {
        let hook = self
            .get_hooks
            .lock()
            .expect("get hooks lock")
            .iter()
            .rev()
            .find(|((s, n), _)| s == subsystem && n == name)
            .map(|(_, hook)| hook.clone());

        if let Some(hook) = hook {
            return hook();
        }

        // Fall back to the last recorded write for this file.
        Ok(self
            .set_values
            .lock()
            .expect("set values lock")
            .iter()
            .rev()
            .find(|set| set.subsystem == subsystem && set.name == name)
            .map(|set| set.value.clone())
            .unwrap_or_default())
    }

    fn subsystem_path(&self, subsystem: &str) -> PathBuf {
        self.root
            .join(subsystem)
            .join(format!("instance-{}", self.id))
    }
}

// =============================================================================
// Fake Quota and Bandwidth Managers
// =============================================================================

/// [`QuotaManager`] recording applied limits.
pub struct FakeQuotaManager {
    pub limited: Mutex<std::collections::HashMap<u32, DiskLimits>>,
    pub get_limits_result: Mutex<DiskLimits>,
    pub get_usage_result: Mutex<DiskStat>,
    pub set_limits_fails: AtomicBool,
    pub get_limits_fails: AtomicBool,
    pub get_usage_fails: AtomicBool,
    pub enabled: AtomicBool,
}

impl FakeQuotaManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            limited: Mutex::new(std::collections::HashMap::new()),
            get_limits_result: Mutex::new(DiskLimits::default()),
            get_usage_result: Mutex::new(DiskStat::default()),
            set_limits_fails: AtomicBool::new(false),
            get_limits_fails: AtomicBool::new(false),
            get_usage_fails: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl QuotaManager for FakeQuotaManager {
    async fn set_limits(&self, uid: u32, limits: &DiskLimits) -> Result<()> {
        if self.set_limits_fails.load(Ordering::SeqCst) {
            return Err(script_error("quota.sh"));
        }
        self.limited
            .lock()
            .expect("limited lock")
            .insert(uid, *limits);
        Ok(())
    }

    async fn get_limits(&self, _uid: u32) -> Result<DiskLimits> {
        if self.get_limits_fails.load(Ordering::SeqCst) {
            return Err(script_error("quota.sh"));
        }
        Ok(*self.get_limits_result.lock().expect("limits lock"))
    }

    async fn get_usage(&self, _uid: u32) -> Result<DiskStat> {
        if self.get_usage_fails.load(Ordering::SeqCst) {
            return Err(script_error("quota.sh"));
        }
        Ok(*self.get_usage_result.lock().expect("usage lock"))
    }

    fn mount_point(&self) -> String {
        "/fake/mount/point".to_string()
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// [`BandwidthManager`] recording applied limits.
pub struct FakeBandwidthManager {
    pub enforced_limits: Mutex<Vec<BandwidthLimits>>,
    pub get_stats_result: Mutex<BandwidthStat>,
    pub set_limits_fails: AtomicBool,
    pub get_stats_fails: AtomicBool,
}

impl FakeBandwidthManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            enforced_limits: Mutex::new(Vec::new()),
            get_stats_result: Mutex::new(BandwidthStat::default()),
            set_limits_fails: AtomicBool::new(false),
            get_stats_fails: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl BandwidthManager for FakeBandwidthManager {
    async fn set_limits(&self, limits: &BandwidthLimits) -> Result<()> {
        if self.set_limits_fails.load(Ordering::SeqCst) {
            return Err(script_error("net_rate.sh"));
        }
        self.enforced_limits
            .lock()
            .expect("enforced lock")
            .push(*limits);
        Ok(())
    }

    async fn get_stats(&self) -> Result<BandwidthStat> {
        if self.get_stats_fails.load(Ordering::SeqCst) {
            return Err(script_error("net_rate.sh"));
        }
        Ok(*self.get_stats_result.lock().expect("stats lock"))
    }
}

// =============================================================================
// Fake Pools
// =============================================================================

/// [`PortAllocator`] handing out sequential ports and recording releases.
pub struct FakePortPool {
    next: Mutex<u32>,
    size: usize,
    pub acquire_fails: AtomicBool,
    pub released: Mutex<Vec<u32>>,
    pub removed: Mutex<Vec<u32>>,
}

impl FakePortPool {
    pub fn new(start: u32) -> Arc<Self> {
        Arc::new(Self {
            next: Mutex::new(start),
            size: 1000,
            acquire_fails: AtomicBool::new(false),
            released: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        })
    }
}

impl PortAllocator for FakePortPool {
    fn acquire(&self) -> Result<u32> {
        if self.acquire_fails.load(Ordering::SeqCst) {
            return Err(Error::PoolExhausted { resource: "port" });
        }
        let mut next = self.next.lock().expect("next lock");
        let port = *next;
        *next += 1;
        Ok(port)
    }

    fn release(&self, port: u32) {
        self.released.lock().expect("released lock").push(port);
    }

    fn remove(&self, port: u32) -> Result<()> {
        self.removed.lock().expect("removed lock").push(port);
        Ok(())
    }

    fn initial_size(&self) -> usize {
        self.size
    }
}

/// [`UidAllocator`] handing out sequential UIDs and recording releases.
pub struct FakeUidPool {
    next: Mutex<u32>,
    size: usize,
    pub acquire_fails: AtomicBool,
    pub remove_fails: AtomicBool,
    pub released: Mutex<Vec<u32>>,
    pub removed: Mutex<Vec<u32>>,
}

impl FakeUidPool {
    pub fn new(start: u32, size: usize) -> Arc<Self> {
        Arc::new(Self {
            next: Mutex::new(start),
            size,
            acquire_fails: AtomicBool::new(false),
            remove_fails: AtomicBool::new(false),
            released: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        })
    }

    pub fn released(&self) -> Vec<u32> {
        self.released.lock().expect("released lock").clone()
    }
}

impl UidAllocator for FakeUidPool {
    fn acquire(&self) -> Result<u32> {
        if self.acquire_fails.load(Ordering::SeqCst) {
            return Err(Error::PoolExhausted { resource: "uid" });
        }
        let mut next = self.next.lock().expect("next lock");
        let uid = *next;
        *next += 1;
        Ok(uid)
    }

    fn release(&self, uid: u32) {
        self.released.lock().expect("released lock").push(uid);
    }

    fn remove(&self, uid: u32) -> Result<()> {
        if self.remove_fails.load(Ordering::SeqCst) {
            return Err(Error::AlreadyAllocated {
                value: format!("uid {uid}"),
            });
        }
        self.removed.lock().expect("removed lock").push(uid);
        Ok(())
    }

    fn initial_size(&self) -> usize {
        self.size
    }
}

/// [`SubnetAllocator`] carving sequential /30s and recording releases.
pub struct FakeNetworkPool {
    supernet: String,
    next_base: Mutex<u32>,
    size: usize,
    pub acquire_fails: AtomicBool,
    pub remove_fails: AtomicBool,
    pub released: Mutex<Vec<Network>>,
    pub removed: Mutex<Vec<Network>>,
}

impl FakeNetworkPool {
    /// Creates a fake pool over the supernet, e.g. `1.2.0.0/20`.
    pub fn new(supernet: &str, first_base: Ipv4Addr, size: usize) -> Arc<Self> {
        Arc::new(Self {
            supernet: supernet.to_string(),
            next_base: Mutex::new(u32::from(first_base)),
            size,
            acquire_fails: AtomicBool::new(false),
            remove_fails: AtomicBool::new(false),
            released: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        })
    }

    pub fn released(&self) -> Vec<Network> {
        self.released.lock().expect("released lock").clone()
    }
}

impl SubnetAllocator for FakeNetworkPool {
    fn acquire(&self) -> Result<Network> {
        if self.acquire_fails.load(Ordering::SeqCst) {
            return Err(Error::PoolExhausted {
                resource: "network",
            });
        }
        let mut next = self.next_base.lock().expect("next lock");
        let network = Network::new(Ipv4Addr::from(*next));
        *next += 4;
        Ok(network)
    }

    fn release(&self, network: &Network) {
        self.released.lock().expect("released lock").push(*network);
    }

    fn remove(&self, network: &Network) -> Result<()> {
        if self.remove_fails.load(Ordering::SeqCst) {
            return Err(Error::AlreadyAllocated {
                value: network.to_string(),
            });
        }
        self.removed.lock().expect("removed lock").push(*network);
        Ok(())
    }

    fn initial_size(&self) -> usize {
        self.size
    }

    fn supernet(&self) -> String {
        self.supernet.clone()
    }
}
