//! Worker socket wire frames
//!
//! Each tunnel message after the handshake is one JSON-encoded
//! [`SocketFrame`]. Frame names encode the direction, so a call id or field
//! name used by both ends at the same time never collides.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SocketFrame {
    // caller → responder
    Call {
        call_id: u64,
        function: String,
        parameter: Value,
    },
    CallAck {
        call_id: u64,
        ack_id: u64,
        data: Value,
    },
    /// The caller stopped reading before the final value
    CallAbandon {
        call_id: u64,
    },

    // responder → caller
    CallData {
        call_id: u64,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },
    CallReturn {
        call_id: u64,
        data: Value,
    },
    CallFail {
        call_id: u64,
        message: String,
    },

    // starter → yielding handler
    StartYielding {
        field: String,
        parameter: Value,
    },
    YieldData {
        field: String,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },
    YieldFinish {
        field: String,
        data: Value,
    },
    YieldFail {
        field: String,
        message: String,
    },

    // yielding handler → starter
    ReadyYielding {
        field: String,
        data: Value,
    },
    RejectYielding {
        field: String,
        message: String,
    },
    YieldAck {
        field: String,
        ack_id: u64,
        data: Value,
    },
    YieldAbandon {
        field: String,
    },
}

impl SocketFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        codec::decode(bytes)
    }
}

/// The sending end of one value stream
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Outlet {
    /// Responder side of a call
    Call(u64),
    /// Starter side of a yielding field
    Field(String),
}

impl Outlet {
    pub fn data(&self, data: Value, ack_id: Option<u64>) -> SocketFrame {
        match self {
            Outlet::Call(call_id) => SocketFrame::CallData {
                call_id: *call_id,
                data,
                ack_id,
            },
            Outlet::Field(field) => SocketFrame::YieldData {
                field: field.clone(),
                data,
                ack_id,
            },
        }
    }

    pub fn finish(&self, data: Value) -> SocketFrame {
        match self {
            Outlet::Call(call_id) => SocketFrame::CallReturn {
                call_id: *call_id,
                data,
            },
            Outlet::Field(field) => SocketFrame::YieldFinish {
                field: field.clone(),
                data,
            },
        }
    }

    pub fn fail(&self, message: String) -> SocketFrame {
        match self {
            Outlet::Call(call_id) => SocketFrame::CallFail {
                call_id: *call_id,
                message,
            },
            Outlet::Field(field) => SocketFrame::YieldFail {
                field: field.clone(),
                message,
            },
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Outlet::Call(call_id) => format!("call {}", call_id),
            Outlet::Field(field) => format!("field '{}'", field),
        }
    }
}

/// The receiving end of one value stream
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Inlet {
    /// Caller side of a call
    Call(u64),
    /// Handler side of a yielding field
    Field(String),
}

impl Inlet {
    pub fn ack(&self, ack_id: u64, data: Value) -> SocketFrame {
        match self {
            Inlet::Call(call_id) => SocketFrame::CallAck {
                call_id: *call_id,
                ack_id,
                data,
            },
            Inlet::Field(field) => SocketFrame::YieldAck {
                field: field.clone(),
                ack_id,
                data,
            },
        }
    }

    /// Tells the producer nobody reads this stream any more
    pub fn abandon(&self) -> SocketFrame {
        match self {
            Inlet::Call(call_id) => SocketFrame::CallAbandon { call_id: *call_id },
            Inlet::Field(field) => SocketFrame::YieldAbandon {
                field: field.clone(),
            },
        }
    }
}
