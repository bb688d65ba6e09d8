//! Process-isolated worker pool.
//!
//! This crate provides:
//! - A pool of worker processes fed from one shared FIFO job queue
//! - One dispatcher thread per worker doing synchronous round trips
//! - A length-prefixed frame protocol over Unix socket pairs
//! - Pluggable payload codecs (JSON, bincode)
//! - The worker-side serve loop for entrypoint binaries
//!
//! A handler that panics takes down only its own worker process.

pub mod codec;
pub mod error;
pub mod ipc;
pub mod pool;
pub mod serve;
pub mod signal;

pub use codec::{BincodeCodec, Codec, JsonCodec};
pub use error::{Error, Result};
pub use pool::{
    Job, JobQueue, Pool, PoolConfig, PoolStats, Submitter, WorkerCommand, WorkerHandle,
    WorkerStatus,
};
pub use serve::{inherited_stream, serve, serve_stdin};
pub use signal::Signal;
