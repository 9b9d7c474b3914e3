//! Value codec used on every wire frame
//!
//! Application values are JSON-like (`serde_json::Value`). Two tagged object
//! shapes extend plain JSON:
//!
//! - `{"$binary": "<base64>"}` carries raw bytes
//! - `{"$callable": "<function>"}` names a function defined on the side that
//!   produced the value; the receiver invokes it through the same worker
//!   socket (see `WorkerSocket::invoke`)

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};

const BINARY_TAG: &str = "$binary";
const CALLABLE_TAG: &str = "$callable";

/// Encode a value to its wire bytes
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode wire bytes into a value
pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::malformed(e.to_string()))
}

/// Wrap raw bytes as a value
pub fn binary(bytes: &[u8]) -> Value {
    json!({ BINARY_TAG: STANDARD.encode(bytes) })
}

/// Extract raw bytes from a value produced by [`binary`]
pub fn as_binary(value: &Value) -> Option<Vec<u8>> {
    let encoded = value.as_object()?.get(BINARY_TAG)?.as_str()?;
    STANDARD.decode(encoded).ok()
}

/// A reference to a function defined on the remote side of a worker socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callable {
    pub function: String,
}

impl Callable {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
        }
    }

    /// The value form that travels on the wire
    pub fn to_value(&self) -> Value {
        json!({ CALLABLE_TAG: self.function })
    }

    /// Recognize a callable inside a received value
    pub fn from_value(value: &Value) -> Option<Self> {
        let function = value.as_object()?.get(CALLABLE_TAG)?.as_str()?;
        Some(Self::new(function))
    }
}

/// Serde adapter: `Vec<u8>` as a base64 string
pub mod base64_bytes {
    use super::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter: `Vec<u8>` as a hex string
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded).map_err(serde::de::Error::custom)
    }
}
