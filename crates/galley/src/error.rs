//! Error types for galley.

use thiserror::Error;

/// Result type for galley operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a worker pool.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to launch a worker process.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// Worker did not complete the readiness handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// IPC communication error with a worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// A frame violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The worker serving a job died before replying.
    #[error("worker {pid} lost: {message}")]
    WorkerLost { pid: u32, message: String },

    /// The pool has been shut down.
    #[error("pool is shut down")]
    ShutDown,

    /// Unknown or undeliverable signal.
    #[error("signal error: {0}")]
    Signal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
