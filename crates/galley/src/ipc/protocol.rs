//! Wire framing for worker connections.
//!
//! Every message is a frame: a 4-byte length (u32 LE) followed by exactly
//! that many bytes of codec-encoded payload. The first frame on a fresh
//! connection is sent by the worker and carries its own process id.

use std::io::{ErrorKind, Read, Write};

use crate::error::{Error, Result};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default upper bound for a single frame body (64 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Length prefix for a body of `body_len` bytes, if it may be sent.
pub fn frame_len(body_len: usize, max_len: usize) -> Result<u32> {
    if body_len > max_len {
        return Err(Error::Protocol(format!(
            "Frame too large to send: {} bytes (limit {})",
            body_len, max_len
        )));
    }
    u32::try_from(body_len).map_err(|_| {
        Error::Protocol(format!(
            "Frame length {} does not fit the length prefix",
            body_len
        ))
    })
}

/// Write one frame and flush the writer.
///
/// Nothing is written if the body is rejected by [`frame_len`].
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8], max_len: usize) -> Result<()> {
    let len = frame_len(body.len(), max_len)?;

    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write frame length: {}", e)))?;
    writer
        .write_all(body)
        .map_err(|e| Error::Ipc(format!("Failed to write frame body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` if the stream ends cleanly before the first byte of
/// the length prefix. A stream that ends anywhere inside a frame is an error.
pub fn read_frame<R: Read>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; LENGTH_PREFIX_LEN];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_LEN {
        match reader.read(&mut len_bytes[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(Error::Ipc(format!(
                    "Connection closed mid-frame after {} of {} length bytes",
                    filled, LENGTH_PREFIX_LEN
                )));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Ipc(format!("Failed to read frame length: {}", e))),
        }
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > max_len {
        return Err(Error::Protocol(format!(
            "Frame too large: {} bytes (limit {})",
            len, max_len
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Error::Ipc(format!("Connection closed mid-frame, expected {} body bytes", len))
        } else {
            Error::Ipc(format!("Failed to read frame body: {}", e))
        }
    })?;

    Ok(Some(body))
}
