//! Process table and out-of-band stream supervision.
//!
//! A process run inside a container is detached from the connection that
//! started it: an external supervisor persists its stdio to disk, and a
//! relay process (`iomux-link`) replays the streams to whoever attaches.
//! One supervision task per process drives the relay, fanning every chunk
//! out to all subscribed receivers and closing them after the terminal
//! exit chunk.
//!
//! Each table entry is either `Running` (relay live, receivers can join)
//! or `Completed` (exit observed, attaching fails with
//! [`Error::ProcessEnded`]).
//!
//! [`Error::ProcessEnded`]: crate::error::Error::ProcessEnded

use crate::command::{Command, CommandRunner, OutputStream, Signal, Signaller};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

/// Exit status reported when the relay ends without a usable exit code.
const UNKNOWN_EXIT_STATUS: u32 = 255;

// =============================================================================
// Stream Chunks
// =============================================================================

/// Which stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

/// One chunk of a supervised process's output.
///
/// Data chunks carry a `source` and bytes. The terminal chunk carries
/// neither; it holds the exit status and is always last. A terminal chunk
/// without an exit status means supervision was lost before the process
/// was observed exiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStream {
    pub source: Option<StreamSource>,
    pub data: Vec<u8>,
    pub exit_status: Option<u32>,
}

impl ProcessStream {
    fn data(source: StreamSource, data: Vec<u8>) -> Self {
        Self {
            source: Some(source),
            data,
            exit_status: None,
        }
    }

    fn terminal(exit_status: Option<u32>) -> Self {
        Self {
            source: None,
            data: Vec::new(),
            exit_status,
        }
    }
}

/// Receiving end of a process's chunk stream.
///
/// The channel closes after the terminal chunk.
pub type ProcessStreamReceiver = mpsc::UnboundedReceiver<ProcessStream>;

// =============================================================================
// Fan-out
// =============================================================================

/// Broadcast point for one process's chunks.
pub(crate) struct FanOut {
    senders: Mutex<Vec<mpsc::UnboundedSender<ProcessStream>>>,
}

impl FanOut {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            senders: Mutex::new(Vec::new()),
        })
    }

    /// Adds a receiver; it sees every chunk sent from now on.
    pub(crate) fn subscribe(&self) -> ProcessStreamReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().expect("fan-out lock").push(tx);
        rx
    }

    /// Sends a chunk to every live receiver.
    pub(crate) fn send(&self, chunk: ProcessStream) {
        self.senders
            .lock()
            .expect("fan-out lock")
            .retain(|sender| sender.send(chunk.clone()).is_ok());
    }

    /// Drops all senders, closing every receiver.
    pub(crate) fn close(&self) {
        self.senders.lock().expect("fan-out lock").clear();
    }
}

// =============================================================================
// Process Table
// =============================================================================

enum ProcessEntry {
    Running {
        fan_out: Arc<FanOut>,
        signaller: Option<Arc<dyn Signaller>>,
    },
    Completed,
}

/// Per-container table of supervised processes.
pub(crate) struct ProcessTable {
    entries: Mutex<HashMap<u32, ProcessEntry>>,
    next_id: Mutex<u32>,
}

impl ProcessTable {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
        })
    }

    /// Hands out the next process ID. The first process gets 0.
    pub(crate) fn allocate_id(&self) -> u32 {
        let mut next = self.next_id.lock().expect("process table lock");
        let id = *next;
        *next += 1;
        id
    }

    /// Ensures future IDs are strictly greater than `id`.
    pub(crate) fn reserve_through(&self, id: u32) {
        let mut next = self.next_id.lock().expect("process table lock");
        if *next <= id {
            *next = id + 1;
        }
    }

    pub(crate) fn insert_running(&self, id: u32, fan_out: Arc<FanOut>) {
        self.entries.lock().expect("process table lock").insert(
            id,
            ProcessEntry::Running {
                fan_out,
                signaller: None,
            },
        );
    }

    fn set_signaller(&self, id: u32, new: Arc<dyn Signaller>) {
        if let Some(ProcessEntry::Running { signaller, .. }) =
            self.entries.lock().expect("process table lock").get_mut(&id)
        {
            *signaller = Some(new);
        }
    }

    fn complete(&self, id: u32) {
        self.entries
            .lock()
            .expect("process table lock")
            .insert(id, ProcessEntry::Completed);
    }

    /// Subscribes to a running process's stream.
    pub(crate) fn attach(&self, id: u32) -> Result<ProcessStreamReceiver> {
        match self.entries.lock().expect("process table lock").get(&id) {
            Some(ProcessEntry::Running { fan_out, .. }) => Ok(fan_out.subscribe()),
            Some(ProcessEntry::Completed) => Err(Error::ProcessEnded(id)),
            None => Err(Error::UnknownProcess(id)),
        }
    }

    /// IDs of processes still under supervision, ascending.
    pub(crate) fn running_ids(&self) -> Vec<u32> {
        let entries = self.entries.lock().expect("process table lock");
        let mut ids: Vec<u32> = entries
            .iter()
            .filter(|(_, entry)| matches!(entry, ProcessEntry::Running { .. }))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Interrupts every live relay so blocked readers unwind.
    pub(crate) fn interrupt_all(&self) {
        let entries = self.entries.lock().expect("process table lock");
        for entry in entries.values() {
            if let ProcessEntry::Running {
                signaller: Some(signaller),
                ..
            } = entry
            {
                signaller.signal(Signal::Interrupt);
            }
        }
    }
}

// =============================================================================
// Supervision
// =============================================================================

/// Spawns the relay for one process and pumps its streams until exit.
///
/// Chunk order: stdout and stderr chunks interleave in arrival order; the
/// terminal chunk comes strictly last, after which every receiver observes
/// channel close and the table entry flips to completed.
pub(crate) fn supervise(
    runner: Arc<dyn CommandRunner>,
    command: Command,
    table: Arc<ProcessTable>,
    process_id: u32,
    fan_out: Arc<FanOut>,
) {
    tokio::spawn(async move {
        let mut child = match runner.spawn(command).await {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(process_id, %err, "failed to re-link process stream");
                fan_out.send(ProcessStream::terminal(None));
                table.complete(process_id);
                fan_out.close();
                return;
            }
        };

        table.set_signaller(process_id, child.signaller());

        let stdout = child.take_stdout();
        let stderr = child.take_stderr();

        let stdout_task = stdout.map(|stream| {
            tokio::spawn(pump(stream, StreamSource::Stdout, fan_out.clone()))
        });
        let stderr_task = stderr.map(|stream| {
            tokio::spawn(pump(stream, StreamSource::Stderr, fan_out.clone()))
        });

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let exit_status = match child.wait().await {
            Ok(status) => status.code().map(|c| c as u32).unwrap_or(UNKNOWN_EXIT_STATUS),
            Err(_) => UNKNOWN_EXIT_STATUS,
        };

        fan_out.send(ProcessStream::terminal(Some(exit_status)));
        table.complete(process_id);
        fan_out.close();
    });
}

async fn pump(mut stream: OutputStream, source: StreamSource, fan_out: Arc<FanOut>) {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => fan_out.send(ProcessStream::data(source, buf[..n].to_vec())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_id_starts_at_zero() {
        let table = ProcessTable::new();
        assert_eq!(table.allocate_id(), 0);
        assert_eq!(table.allocate_id(), 1);
    }

    #[test]
    fn test_reserve_through_skips_restored_ids() {
        let table = ProcessTable::new();
        table.reserve_through(1);
        assert_eq!(table.allocate_id(), 2);

        // Reserving below the counter never goes backwards.
        table.reserve_through(0);
        assert_eq!(table.allocate_id(), 3);
    }

    #[test]
    fn test_attach_errors() {
        let table = ProcessTable::new();
        assert!(matches!(table.attach(42), Err(Error::UnknownProcess(42))));

        table.insert_running(0, FanOut::new());
        table.complete(0);
        assert!(matches!(table.attach(0), Err(Error::ProcessEnded(0))));
    }

    #[test]
    fn test_fan_out_delivers_to_all_subscribers() {
        let fan_out = FanOut::new();
        let mut first = fan_out.subscribe();
        let mut second = fan_out.subscribe();

        fan_out.send(ProcessStream::data(StreamSource::Stdout, b"hi".to_vec()));
        fan_out.close();

        let a = first.try_recv().unwrap();
        let b = second.try_recv().unwrap();
        assert_eq!(a, b);
        assert!(first.try_recv().is_err());
    }

    #[test]
    fn test_running_ids_excludes_completed() {
        let table = ProcessTable::new();
        table.insert_running(2, FanOut::new());
        table.insert_running(0, FanOut::new());
        table.insert_running(1, FanOut::new());
        table.complete(1);

        assert_eq!(table.running_ids(), vec![0, 2]);
    }
}
