//! Worker-side serve loop.
//!
//! A worker entrypoint binary embeds its handler and calls [`serve_stdin`].
//! The pool hands each worker its end of the connection as stdin, so the
//! handler never has to be shipped across the process boundary.
//!
//! ```no_run
//! use galley::JsonCodec;
//!
//! fn main() -> galley::Result<()> {
//!     galley::serve_stdin(JsonCodec, |n: u64| n * 2)?;
//!     Ok(())
//! }
//! ```

use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::ipc::Transport;

/// Recover the connection a pool passed to this process as stdin.
pub fn inherited_stream() -> Result<UnixStream> {
    let fd = std::io::stdin()
        .as_fd()
        .try_clone_to_owned()
        .map_err(|e| Error::Handshake(format!("Failed to duplicate stdin: {}", e)))?;
    let stream = UnixStream::from(fd);

    // A plain pipe or terminal on stdin means we were not started by a pool.
    stream.peer_addr().map_err(|e| {
        Error::Handshake(format!(
            "stdin is not a worker socket ({}); workers must be launched by a pool",
            e
        ))
    })?;

    Ok(stream)
}

/// Serve jobs on the connection inherited through stdin.
pub fn serve_stdin<C, Req, Resp, F>(codec: C, handler: F) -> Result<u64>
where
    C: Codec,
    Req: DeserializeOwned,
    Resp: Serialize,
    F: FnMut(Req) -> Resp,
{
    serve(inherited_stream()?, codec, handler)
}

/// Announce readiness on `stream`, then answer jobs until the pool closes
/// the connection.
///
/// Returns the number of jobs served. The handler runs on the calling
/// thread; a panic inside it is not caught and takes the worker down.
pub fn serve<C, Req, Resp, F>(stream: UnixStream, codec: C, mut handler: F) -> Result<u64>
where
    C: Codec,
    Req: DeserializeOwned,
    Resp: Serialize,
    F: FnMut(Req) -> Resp,
{
    let mut transport = Transport::new(stream, Arc::new(codec))?;
    let pid = std::process::id();
    transport.announce(pid)?;
    tracing::debug!("Worker {} ready ({} codec)", pid, transport.codec().name());

    let mut served = 0u64;
    while let Some(job) = transport.try_receive::<Req>()? {
        let result = handler(job);
        transport.send(&result)?;
        served += 1;
    }

    tracing::debug!("Worker {} connection closed after {} jobs", pid, served);
    Ok(served)
}
