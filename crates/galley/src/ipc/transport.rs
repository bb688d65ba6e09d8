//! Codec-aware framed channel over a Unix stream socket.

use std::io::{BufReader, BufWriter};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::Codec;
use crate::error::{Error, Result};

use super::protocol::{DEFAULT_MAX_FRAME_LEN, frame_len, read_frame, write_frame};

/// One endpoint of a worker connection.
///
/// Each side of a connection has exactly one `Transport`, owned by a single
/// thread: the dispatcher on the pool side, the serve loop in the worker.
/// There is no locking and no multiplexing; `request` is one full round trip.
pub struct Transport<C: Codec> {
    reader: BufReader<UnixStream>,
    writer: BufWriter<UnixStream>,
    codec: Arc<C>,
    max_frame_len: usize,
}

impl<C: Codec> Transport<C> {
    /// Wrap a connected stream.
    pub fn new(stream: UnixStream, codec: Arc<C>) -> Result<Self> {
        let read_half = stream
            .try_clone()
            .map_err(|e| Error::Ipc(format!("Failed to clone worker stream: {}", e)))?;
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(stream),
            codec,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        })
    }

    /// Override the per-frame size limit.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// The codec used for payloads on this connection.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Encode and send one value.
    pub fn send<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let body = self.encode(value)?;
        self.send_encoded(&body)
    }

    /// Encode a value into a frame body that fits this connection.
    ///
    /// Touches only the codec; an error here leaves the connection usable.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let body = self.codec.encode(value)?;
        frame_len(body.len(), self.max_frame_len)?;
        Ok(body)
    }

    /// Send a body produced by [`Transport::encode`].
    pub fn send_encoded(&mut self, body: &[u8]) -> Result<()> {
        write_frame(&mut self.writer, body, self.max_frame_len)
    }

    /// Receive and decode one value, treating end of stream as an error.
    pub fn receive<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.try_receive()?
            .ok_or_else(|| Error::Ipc("Connection closed by peer".to_string()))
    }

    /// Receive and decode one value, or `None` if the peer closed the
    /// connection between frames.
    pub fn try_receive<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match read_frame(&mut self.reader, self.max_frame_len)? {
            Some(bytes) => self.codec.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Send a value and block until the reply arrives.
    pub fn request<Req, Resp>(&mut self, value: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.send(value)?;
        self.receive()
    }

    /// Send the readiness announcement (worker side).
    pub fn announce(&mut self, pid: u32) -> Result<()> {
        self.send(&pid)
    }

    /// Wait for the readiness announcement (pool side).
    pub fn await_announcement(&mut self) -> Result<u32> {
        match self.try_receive::<u32>() {
            Ok(Some(pid)) => Ok(pid),
            Ok(None) => Err(Error::Handshake(
                "Worker closed the connection before announcing readiness".to_string(),
            )),
            Err(e) => Err(Error::Handshake(format!(
                "Invalid readiness announcement: {}",
                e
            ))),
        }
    }
}
