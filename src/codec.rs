//! Text transcoding for the message channel.
//!
//! The transport only carries text, so every binary engine message crosses
//! the boundary as standard base64. Structural decoding of the engine's wire
//! messages stays with the engine types (CBOR via `ciborium`); this module
//! owns only the text layer and the glue between the two.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Input was not valid standard base64 (bad alphabet, padding, or length).
    #[error("base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),

    /// CBOR encoding failed.
    #[error("message encoding failed: {0}")]
    Encode(String),

    /// CBOR decoding failed, or the decoded bytes had the wrong shape.
    #[error("message decoding failed: {0}")]
    Decode(String),
}

/// Encode bytes as standard base64.
pub fn encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode standard base64 into bytes.
///
/// Rejects characters outside the alphabet, non-canonical padding, and
/// truncated input. `decode(encode(b)) == b` for all byte sequences.
pub fn decode(text: &str) -> Result<Vec<u8>, CodecError> {
    Ok(BASE64.decode(text)?)
}

/// Serialize an engine wire message and base64-encode it for transport.
pub fn encode_message<T: Serialize>(value: &T) -> Result<String, CodecError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|e| CodecError::Encode(format!("{:?}", e)))?;
    Ok(encode(&bytes))
}

/// Base64-decode and deserialize an engine wire message.
pub fn decode_message<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    let bytes = decode(text)?;
    ciborium::from_reader(bytes.as_slice()).map_err(|e| CodecError::Decode(format!("{:?}", e)))
}
