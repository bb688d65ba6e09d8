//! Inter-process communication between a pool and its worker processes.
//!
//! This module provides the frame protocol, the codec-aware transport built
//! on it, and the pool-side handling of worker processes.

pub mod process;
pub mod protocol;
mod transport;

pub use process::{WorkerProcess, launch};
pub use protocol::{DEFAULT_MAX_FRAME_LEN, LENGTH_PREFIX_LEN, read_frame, write_frame};
pub use transport::Transport;
