//! Error types for the container backend.

use std::path::PathBuf;

/// Result type alias for backend operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the container backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Resource Pool Errors
    // =========================================================================
    /// Pool has no free values left.
    #[error("{resource} pool is exhausted")]
    PoolExhausted { resource: &'static str },

    /// Value does not belong to the pool's range.
    #[error("{value} is not a member of the pool")]
    NotInPool { value: String },

    /// Value is already held by a container.
    #[error("{value} is already allocated")]
    AlreadyAllocated { value: String },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// No container is registered under the given handle.
    #[error("unknown handle: {0}")]
    UnknownHandle(String),

    // =========================================================================
    // Process Errors
    // =========================================================================
    /// No process with the given ID exists in the container.
    #[error("unknown process: {0}")]
    UnknownProcess(u32),

    /// The process ran to completion; its stream can no longer be attached.
    #[error("process {0} has already ended")]
    ProcessEnded(u32),

    /// The process supervisor closed its stdout before reporting `active`.
    #[error("process supervisor {path} ended before the process became active")]
    ProcessNotActive { path: PathBuf },

    // =========================================================================
    // Network Rule Errors
    // =========================================================================
    /// A net-out rule needs at least a network or a port.
    #[error("net-out rule requires a network or a port")]
    InvalidNetOut,

    /// A CIDR string did not parse or has an unusable prefix.
    #[error("invalid CIDR network: {0}")]
    InvalidCidr(String),

    // =========================================================================
    // Script Errors
    // =========================================================================
    /// An isolation script exited non-zero.
    #[error("{path} exited with status {status}")]
    ScriptFailed { path: PathBuf, status: i32 },

    /// Output from a script or cgroup file did not parse.
    #[error("unexpected output from {origin}: {detail}")]
    MalformedOutput { origin: String, detail: String },

    // =========================================================================
    // Snapshot Errors
    // =========================================================================
    /// Writing a snapshot to disk failed.
    #[error("failed to save snapshot: {0}")]
    FailedToSnapshot(#[source] Box<Error>),

    /// A snapshot byte stream did not decode.
    #[error("failed to decode snapshot: {0}")]
    Decode(#[from] serde_json::Error),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
