//! Outbound message bodies.
//!
//! Everything on the wire is JSON. Raw bytes and strings are checked to
//! already be JSON; structured values are serialized.

use bytes::Bytes;
use serde::de::IgnoredAny;
use serde::Serialize;
use serde_json::Value;

use crate::error::{CourierError, Result};

/// A message body accepted by `publish`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Pre-encoded bytes; must parse as JSON.
    Raw(Bytes),
    /// Pre-encoded text; must parse as JSON.
    Text(String),
    /// A value to serialize.
    Value(Value),
}

impl Payload {
    /// Serialize any `Serialize` type into a payload.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(Payload::Value)
            .map_err(|e| CourierError::InvalidPayload(e.to_string()))
    }

    /// Wire bytes for this payload.
    pub fn into_bytes(self) -> Result<Bytes> {
        match self {
            Payload::Raw(bytes) => {
                ensure_json(serde_json::from_slice::<IgnoredAny>(&bytes))?;
                Ok(bytes)
            }
            Payload::Text(text) => {
                ensure_json(serde_json::from_str::<IgnoredAny>(&text))?;
                Ok(Bytes::from(text))
            }
            Payload::Value(value) => serde_json::to_vec(&value)
                .map(Bytes::from)
                .map_err(|e| CourierError::InvalidPayload(e.to_string())),
        }
    }
}

fn ensure_json(parsed: serde_json::Result<IgnoredAny>) -> Result<()> {
    parsed
        .map(|_| ())
        .map_err(|e| CourierError::InvalidPayload(format!("data must be valid JSON: {}", e)))
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Raw(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Raw(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Raw(Bytes::copy_from_slice(bytes))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Value(value)
    }
}
