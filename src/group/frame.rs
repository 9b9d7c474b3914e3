//! Worker group wire types

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::codec;
use crate::error::{Error, Result};
use crate::peer::WorkerId;

/// Fixed-length channel identifier (16 random bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub [u8; 16]);

impl ChannelId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for ChannelId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        let id: [u8; 16] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("channel id must be 16 bytes"))?;
        Ok(Self(id))
    }
}

/// What a channel is, as told to members that learn of it over a link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub id: ChannelId,
    pub purpose: String,
    pub members: Vec<WorkerId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Broadcast,
    Request,
    Synchronize,
    Variable,
    Authority,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok { data: Value },
    Err { message: String },
}

impl Outcome {
    pub fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(data) => Outcome::Ok { data },
            Err(e) => Outcome::Err {
                message: e.to_string(),
            },
        }
    }

    pub fn into_result(self, worker_id: WorkerId) -> Result<Value> {
        match self {
            Outcome::Ok { data } => Ok(data),
            Outcome::Err { message } => Err(Error::GroupRequestFailed { worker_id, message }),
        }
    }
}

/// One message on a channel link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupFrame {
    Request {
        request_id: u64,
        kind: RequestKind,
        payload: Value,
    },
    Response {
        request_id: u64,
        outcome: Outcome,
    },
    /// Third leg of a synchronize
    Acknowledge { request_id: u64, payload: Value },
}

impl GroupFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        codec::decode(bytes)
    }
}
