//! Child process capability for script-driven side effects.
//!
//! Every isolation primitive in this backend is an external executable with
//! a documented argument and environment contract. The [`CommandRunner`]
//! trait is the single seam through which those executables are invoked, so
//! the whole core can run against scripted fakes (see [`crate::testing`])
//! without any kernel features.
//!
//! Two invocation shapes cover everything the backend needs:
//!
//! - [`CommandRunner::run`]: spawn, wait, capture stdout. A non-zero exit
//!   is surfaced as [`Error::ScriptFailed`]. Used for `setup.sh`,
//!   `create.sh`, `net.sh` and friends.
//! - [`CommandRunner::spawn`]: spawn with piped stdio and hand back a
//!   [`Child`]. Used for the long-lived helpers (`iomux-spawn`,
//!   `iomux-link`, the OOM notifier, `wsh` streams) that outlive the call
//!   that started them.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Readable end of a child's stdout or stderr pipe.
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Writable end of a child's stdin pipe.
pub type InputStream = Box<dyn AsyncWrite + Send + Unpin>;

// =============================================================================
// Command
// =============================================================================

/// Specification of a child process to run.
///
/// The environment is *not* inherited: a spawned child sees exactly the
/// `env` pairs listed here, mirroring how the isolation scripts are given
/// a fully explicit environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    /// Path to the executable.
    pub path: PathBuf,
    /// Arguments, not including the executable itself.
    pub args: Vec<String>,
    /// Complete environment for the child.
    pub env: Vec<(String, String)>,
    /// Bytes written to the child's stdin after spawning, after which
    /// stdin is closed. `None` leaves stdin open for the caller to drive.
    pub stdin: Option<Vec<u8>>,
}

impl Command {
    /// Creates a command for the given executable.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Appends a single argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Appends an environment pair.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Appends several environment pairs.
    #[must_use]
    pub fn envs<I>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env.extend(pairs);
        self
    }

    /// Sets the bytes fed to the child's stdin.
    #[must_use]
    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }
}

// =============================================================================
// Exit Status
// =============================================================================

/// Exit status of a finished child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    code: Option<i32>,
}

impl ExitStatus {
    /// Status for a process that exited with the given code.
    pub fn from_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    /// Status for a process terminated by a signal (no exit code).
    pub fn from_signal() -> Self {
        Self { code: None }
    }

    /// Returns true if the process exited with code 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit code, if the process exited normally.
    pub fn code(&self) -> Option<i32> {
        self.code
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

// =============================================================================
// Signals
// =============================================================================

/// Signal delivered to a supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT; unblocks a stream relay without reaping its process.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// SIGKILL.
    Kill,
}

impl Signal {
    /// Returns the raw signal number.
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Interrupt => libc::SIGINT,
            Self::Terminate => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interrupt => write!(f, "SIGINT"),
            Self::Terminate => write!(f, "SIGTERM"),
            Self::Kill => write!(f, "SIGKILL"),
        }
    }
}

// =============================================================================
// Runner and Child Traits
// =============================================================================

/// Capability to invoke external executables.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs a command to completion and returns its captured stdout.
    ///
    /// A non-zero exit becomes [`Error::ScriptFailed`] carrying the
    /// executable path and status.
    async fn run(&self, command: Command) -> Result<Vec<u8>>;

    /// Spawns a command without waiting for it.
    ///
    /// All three stdio streams are piped. If [`Command::stdin`] is set the
    /// bytes are written and stdin closed on the caller's behalf.
    async fn spawn(&self, command: Command) -> Result<Box<dyn Child>>;
}

/// A spawned child process.
///
/// Streams are taken at most once; [`Child::wait`] consumes the handle.
/// A [`Signaller`] obtained before waiting stays valid after the child
/// exits (delivery to a reaped process is a no-op).
#[async_trait]
pub trait Child: Send {
    /// Takes the stdout pipe, if not already taken.
    fn take_stdout(&mut self) -> Option<OutputStream>;

    /// Takes the stderr pipe, if not already taken.
    fn take_stderr(&mut self) -> Option<OutputStream>;

    /// Takes the stdin pipe, if not already taken or pre-fed.
    fn take_stdin(&mut self) -> Option<InputStream>;

    /// Returns a handle for delivering signals to this child.
    fn signaller(&self) -> Arc<dyn Signaller>;

    /// Waits for the child to exit.
    async fn wait(self: Box<Self>) -> Result<ExitStatus>;
}

/// Best-effort signal delivery to a child that may have already exited.
pub trait Signaller: Send + Sync {
    /// Delivers a signal. Errors (e.g. the process is gone) are swallowed.
    fn signal(&self, signal: Signal);
}

// =============================================================================
// Process Runner (tokio implementation)
// =============================================================================

/// [`CommandRunner`] backed by real host processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Creates a process runner.
    pub fn new() -> Self {
        Self
    }

    fn build(command: &Command) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&command.path);
        cmd.args(&command.args);
        cmd.env_clear();
        cmd.envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: Command) -> Result<Vec<u8>> {
        let mut cmd = Self::build(&command);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if command.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd.spawn()?;

        if let Some(data) = command.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(&data).await?;
                stdin.shutdown().await?;
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::ScriptFailed {
                path: command.path,
                status: output.status.code().unwrap_or(-1),
            });
        }

        Ok(output.stdout)
    }

    async fn spawn(&self, command: Command) -> Result<Box<dyn Child>> {
        let mut cmd = Self::build(&command);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        let pid = child.id().map(|pid| pid as i32);

        if let Some(data) = command.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    let _ = stdin.write_all(&data).await;
                    let _ = stdin.shutdown().await;
                });
            }
        }

        Ok(Box::new(ProcessChild { inner: child, pid }))
    }
}

struct ProcessChild {
    inner: tokio::process::Child,
    pid: Option<i32>,
}

#[async_trait]
impl Child for ProcessChild {
    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.inner
            .stdout
            .take()
            .map(|s| Box::new(s) as OutputStream)
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.inner
            .stderr
            .take()
            .map(|s| Box::new(s) as OutputStream)
    }

    fn take_stdin(&mut self) -> Option<InputStream> {
        self.inner.stdin.take().map(|s| Box::new(s) as InputStream)
    }

    fn signaller(&self) -> Arc<dyn Signaller> {
        Arc::new(PidSignaller { pid: self.pid })
    }

    async fn wait(mut self: Box<Self>) -> Result<ExitStatus> {
        let status = self.inner.wait().await?;
        Ok(status.into())
    }
}

struct PidSignaller {
    pid: Option<i32>,
}

impl Signaller for PidSignaller {
    fn signal(&self, signal: Signal) {
        if let Some(pid) = self.pid {
            // Delivery failure means the process is already gone.
            unsafe {
                libc::kill(pid, signal.as_raw());
            }
        }
    }
}
