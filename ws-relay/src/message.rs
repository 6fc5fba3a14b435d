use std::str;

use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Utf8Bytes;

/// A relayed payload: any JSON value that parsed successfully.
///
/// The relay never inspects the structure beyond parsing it. Forwarded copies are the compact
/// re-encoding of the parsed value, so whitespace and escapes may differ from what the sender
/// wrote while the decoded value stays the same.
#[derive(Debug, Clone, PartialEq)]
pub struct Message(Value);

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] str::Utf8Error),
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Message {
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        Ok(Self(serde_json::from_str(text)?))
    }

    /// Binary frames are accepted as long as they carry UTF-8 JSON.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::decode(str::from_utf8(bytes)?)
    }

    /// Encodes once into a text payload that can be cloned cheaply for every recipient.
    pub fn encode(&self) -> Utf8Bytes {
        Utf8Bytes::from(self.0.to_string())
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Self(value)
    }
}
