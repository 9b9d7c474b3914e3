//! Protocol registry and the handshake that assigns tunnels to protocols
//!
//! Every wire protocol is a [`ProtocolModule`] addressed by a one-byte code
//! that leads its synchronize payload. The registry is assembled once at
//! start-up and is read-only afterwards.

pub mod handshake;
mod version;

pub use handshake::*;
pub use version::*;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::tunnel::Tunnel;

/// Protocol code of worker sockets
pub const WORKER_PROTOCOL: u8 = 0x01;

/// Protocol code of worker group channels
pub const WORKER_GROUP_PROTOCOL: u8 = 0x02;

/// One wire protocol
#[async_trait]
pub trait ProtocolModule: Send + Sync {
    /// Leading byte of this protocol's synchronize payloads
    fn protocol_code(&self) -> u8;

    /// Name for logs
    fn name(&self) -> &'static str;

    /// Inspect the first payload of an accepted tunnel.
    ///
    /// Returning a response claims the tunnel; `None` declines it. Must be
    /// fast and keep no state: the coordinator hands the response back to
    /// [`acknowledge`](Self::acknowledge).
    async fn synchronize(&self, payload: &[u8]) -> Option<Vec<u8>>;

    /// The initiator acknowledged `response`; the tunnel now belongs to the module
    async fn acknowledge(
        &self,
        synchronize: Vec<u8>,
        response: Vec<u8>,
        acknowledge: Vec<u8>,
        tunnel: Tunnel,
    );
}

/// Prefix a protocol body with its code
pub fn framed(code: u8, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(body.len() + 1);
    payload.push(code);
    payload.extend_from_slice(body);
    payload
}

/// Split a payload into its code and body when it leads with `code`
pub fn strip_code(code: u8, payload: &[u8]) -> Option<&[u8]> {
    match payload.split_first() {
        Some((first, body)) if *first == code => Some(body),
        _ => None,
    }
}

/// Fixed table of protocol modules
#[derive(Default)]
pub struct ProtocolRegistry {
    modules: BTreeMap<u8, Arc<dyn ProtocolModule>>,
}

impl ProtocolRegistry {
    pub fn builder() -> ProtocolRegistryBuilder {
        ProtocolRegistryBuilder::default()
    }

    pub fn module(&self, code: u8) -> Option<Arc<dyn ProtocolModule>> {
        self.modules.get(&code).cloned()
    }

    /// Modules in protocol-code order
    pub fn modules(&self) -> impl Iterator<Item = &Arc<dyn ProtocolModule>> {
        self.modules.values()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Collects modules before the registry is frozen
#[derive(Default)]
pub struct ProtocolRegistryBuilder {
    modules: BTreeMap<u8, Arc<dyn ProtocolModule>>,
}

impl ProtocolRegistryBuilder {
    pub fn register(mut self, module: Arc<dyn ProtocolModule>) -> Result<Self> {
        let code = module.protocol_code();
        if let Some(existing) = self.modules.get(&code) {
            return Err(Error::Internal(format!(
                "protocol code {:#04x} registered twice ({} and {})",
                code,
                existing.name(),
                module.name()
            )));
        }
        self.modules.insert(code, module);
        Ok(self)
    }

    pub fn build(self) -> ProtocolRegistry {
        ProtocolRegistry {
            modules: self.modules,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
