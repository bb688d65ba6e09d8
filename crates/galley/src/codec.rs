//! Payload codecs.
//!
//! A codec turns payload values into the bytes carried inside a frame and
//! back. The pool and its worker processes must agree on the codec; nothing
//! on the wire identifies which one produced a frame.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Pluggable encode/decode capability for job payloads and results.
///
/// Implementations must be stateless with respect to individual values:
/// `decode(encode(x)) == x` for every value the codec can represent.
pub trait Codec: Send + Sync + 'static {
    /// Encode a value into bytes.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode a value from bytes.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Short name used in logs and on the worker command line.
    fn name(&self) -> &'static str;
}

/// JSON codec backed by `serde_json`.
///
/// Self-describing, so workers can accept loosely typed payloads such as
/// `serde_json::Value`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| Error::Serialization(format!("Failed to encode JSON payload: {}", e)))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Deserialization(format!("Failed to decode JSON payload: {}", e)))
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

/// Compact binary codec backed by `bincode`.
///
/// Not self-describing: both sides must use the exact same payload types.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value)
            .map_err(|e| Error::Serialization(format!("Failed to encode bincode payload: {}", e)))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| {
            Error::Deserialization(format!("Failed to decode bincode payload: {}", e))
        })
    }

    fn name(&self) -> &'static str {
        "bincode"
    }
}
