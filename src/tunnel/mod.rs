//! Tunnels and the transports that create them
//!
//! A tunnel is one duplex byte-message session between two processes. Its
//! lifecycle is visible as a stream of [`TunnelEvent`]s; end of that stream is
//! the close event. Whoever holds the [`Tunnel`] value owns it: ownership moves
//! by value, exactly once, from the transport to the handshake coordinator and
//! from there to a protocol module.
//!
//! Transports:
//! - `tcp`: length-prefixed frames over TCP
//! - `memory`: in-process pairs, for embedding several workers in one process

pub mod memory;
pub mod tcp;

pub use memory::*;
pub use tcp::*;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::{Error, Result};

static NEXT_TUNNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique tunnel identifier (for logs)
pub type TunnelId = u64;

fn next_tunnel_id() -> TunnelId {
    NEXT_TUNNEL_ID.fetch_add(1, Ordering::Relaxed)
}

// ─────────────────────────────────────────────────────────────────
// Tunnel Events & Attributes
// ─────────────────────────────────────────────────────────────────

/// Inbound tunnel event. The stream ending is the close event.
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelEvent {
    /// One complete message from the remote side
    Data(Vec<u8>),

    /// Transport failure; the tunnel closes right after
    Error(String),
}

/// Attribute bag supplied by the transport
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelAttributes {
    /// Name of the local interface the tunnel belongs to
    pub interface: String,

    /// True when a local connector opened the tunnel, false when a listener accepted it
    pub from_connector: bool,

    /// Transport-level remote address, if known
    pub remote_address: Option<String>,
}

impl TunnelAttributes {
    pub fn connector(interface: &str, remote_address: Option<String>) -> Self {
        Self {
            interface: interface.to_string(),
            from_connector: true,
            remote_address,
        }
    }

    pub fn listener(interface: &str, remote_address: Option<String>) -> Self {
        Self {
            interface: interface.to_string(),
            from_connector: false,
            remote_address,
        }
    }
}

pub(crate) enum Outbound {
    Data(Vec<u8>, Option<oneshot::Sender<bool>>),
    Close,
}

// ─────────────────────────────────────────────────────────────────
// Tunnel
// ─────────────────────────────────────────────────────────────────

/// Cloneable sending half of a tunnel
#[derive(Clone)]
pub struct TunnelSender {
    id: TunnelId,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl TunnelSender {
    pub fn id(&self) -> TunnelId {
        self.id
    }

    /// Send one message and wait until the transport has written it
    pub async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.outbound
            .send(Outbound::Data(bytes, Some(done_tx)))
            .map_err(|_| Error::TunnelClosed)?;
        match done_rx.await {
            Ok(true) => Ok(()),
            _ => Err(Error::TunnelClosed),
        }
    }

    /// Queue one message without waiting for the write
    pub fn send_nowait(&self, bytes: Vec<u8>) -> Result<()> {
        self.outbound
            .send(Outbound::Data(bytes, None))
            .map_err(|_| Error::TunnelClosed)
    }

    /// Close both directions once queued messages are flushed
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Receiving half of a tunnel
pub struct TunnelReceiver {
    id: TunnelId,
    events: mpsc::UnboundedReceiver<TunnelEvent>,
}

impl TunnelReceiver {
    pub fn id(&self) -> TunnelId {
        self.id
    }

    /// Next event; `None` once the tunnel is closed
    pub async fn next_event(&mut self) -> Option<TunnelEvent> {
        self.events.recv().await
    }
}

/// An open tunnel: attributes plus both halves
pub struct Tunnel {
    attributes: TunnelAttributes,
    sender: TunnelSender,
    receiver: TunnelReceiver,
}

impl Tunnel {
    pub(crate) fn from_channels(
        attributes: TunnelAttributes,
        outbound: mpsc::UnboundedSender<Outbound>,
        events: mpsc::UnboundedReceiver<TunnelEvent>,
    ) -> Self {
        let id = next_tunnel_id();
        Self {
            attributes,
            sender: TunnelSender { id, outbound },
            receiver: TunnelReceiver { id, events },
        }
    }

    pub fn id(&self) -> TunnelId {
        self.sender.id
    }

    pub fn attributes(&self) -> &TunnelAttributes {
        &self.attributes
    }

    /// Look up a transport attribute by name
    pub fn return_value(&self, attribute: &str) -> Option<Value> {
        match attribute {
            "from_connector" => Some(json!(self.attributes.from_connector)),
            "interface" => Some(json!(self.attributes.interface)),
            "remote_address" => self.attributes.remote_address.as_ref().map(|a| json!(a)),
            _ => None,
        }
    }

    /// A sending handle that stays valid after the tunnel is split
    pub fn sender(&self) -> TunnelSender {
        self.sender.clone()
    }

    pub async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.sender.send(bytes).await
    }

    pub async fn next_event(&mut self) -> Option<TunnelEvent> {
        self.receiver.next_event().await
    }

    pub fn close(&self) {
        debug!(tunnel = self.id(), "Closing tunnel");
        self.sender.close();
    }

    pub fn into_parts(self) -> (TunnelAttributes, TunnelSender, TunnelReceiver) {
        (self.attributes, self.sender, self.receiver)
    }
}

// ─────────────────────────────────────────────────────────────────
// Transport Contract
// ─────────────────────────────────────────────────────────────────

/// A transport implementation (TCP, in-memory, ...)
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short transport name for logs
    fn kind(&self) -> &'static str;

    /// Start accepting tunnels for `interface`; accepted tunnels go to `accepted`
    async fn listen(
        &self,
        interface: &str,
        settings: &Value,
        accepted: mpsc::Sender<Tunnel>,
    ) -> Result<()>;

    /// Open a tunnel to a remote listener
    async fn connect(&self, interface: &str, settings: &Value) -> Result<Tunnel>;
}

/// Identifier returned by [`InterfaceRegistry::create_interface`]
pub type InterfaceId = u64;

struct Interface {
    id: InterfaceId,
    transport: Arc<dyn Transport>,
}

/// Named interfaces of this worker, each backed by a transport
pub struct InterfaceRegistry {
    interfaces: RwLock<HashMap<String, Interface>>,
    next_id: AtomicU64,
    accepted: mpsc::Sender<Tunnel>,
}

impl InterfaceRegistry {
    /// `accepted` receives every tunnel accepted by any listening interface
    pub fn new(accepted: mpsc::Sender<Tunnel>) -> Self {
        Self {
            interfaces: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            accepted,
        }
    }

    /// Register an interface; with `listen_settings` it also starts accepting
    pub async fn create_interface(
        &self,
        name: &str,
        transport: Arc<dyn Transport>,
        listen_settings: Option<&Value>,
    ) -> Result<InterfaceId> {
        if let Some(settings) = listen_settings {
            transport
                .listen(name, settings, self.accepted.clone())
                .await?;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!(
            interface = name,
            transport = transport.kind(),
            listening = listen_settings.is_some(),
            "Interface created"
        );
        self.interfaces
            .write()
            .insert(name.to_string(), Interface { id, transport });
        Ok(id)
    }

    /// Open a tunnel through a named interface
    pub async fn create_tunnel(&self, interface: &str, connect_settings: &Value) -> Result<Tunnel> {
        let transport = self
            .interfaces
            .read()
            .get(interface)
            .map(|i| Arc::clone(&i.transport))
            .ok_or_else(|| Error::InterfaceNotFound(interface.to_string()))?;
        transport.connect(interface, connect_settings).await
    }

    pub fn interface_id(&self, name: &str) -> Option<InterfaceId> {
        self.interfaces.read().get(name).map(|i| i.id)
    }

    pub fn interface_names(&self) -> Vec<String> {
        self.interfaces.read().keys().cloned().collect()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_exchanges_data() {
        let (mut a, mut b) = memory_pair("mem", None);
        a.send(b"hello".to_vec()).await.unwrap();
        b.send(b"world".to_vec()).await.unwrap();

        assert_eq!(b.next_event().await, Some(TunnelEvent::Data(b"hello".to_vec())));
        assert_eq!(a.next_event().await, Some(TunnelEvent::Data(b"world".to_vec())));
    }

    #[tokio::test]
    async fn test_return_value_attributes() {
        let (a, b) = memory_pair("mem", Some("worker-2".to_string()));
        assert_eq!(a.return_value("from_connector"), Some(json!(true)));
        assert_eq!(b.return_value("from_connector"), Some(json!(false)));
        assert_eq!(a.return_value("interface"), Some(json!("mem")));
        assert_eq!(a.return_value("remote_address"), Some(json!("worker-2")));
        assert_eq!(b.return_value("remote_address"), None);
        assert_eq!(a.return_value("latency"), None);
    }

    #[tokio::test]
    async fn test_close_reaches_both_ends() {
        let (mut a, mut b) = memory_pair("mem", None);
        a.close();

        assert_eq!(b.next_event().await, None);
        assert_eq!(a.next_event().await, None);
        assert!(matches!(a.send(vec![1]).await, Err(Error::TunnelClosed)));
    }

    #[tokio::test]
    async fn test_queued_data_flushes_before_close() {
        let (a, mut b) = memory_pair("mem", None);
        a.sender().send_nowait(vec![1]).unwrap();
        a.sender().send_nowait(vec![2]).unwrap();
        a.close();

        assert_eq!(b.next_event().await, Some(TunnelEvent::Data(vec![1])));
        assert_eq!(b.next_event().await, Some(TunnelEvent::Data(vec![2])));
        assert_eq!(b.next_event().await, None);
    }

    #[tokio::test]
    async fn test_attributes() {
        let (a, b) = memory_pair("mem", Some("worker-2".to_string()));
        assert_eq!(a.return_value("from_connector"), Some(json!(true)));
        assert_eq!(b.return_value("from_connector"), Some(json!(false)));
        assert_eq!(a.return_value("interface"), Some(json!("mem")));
        assert_eq!(a.return_value("unknown"), None);
    }

    #[tokio::test]
    async fn test_unknown_interface() {
        let (tx, _rx) = mpsc::channel(1);
        let registry = InterfaceRegistry::new(tx);
        let err = registry.create_tunnel("nope", &json!({})).await.err().unwrap();
        assert!(matches!(err, Error::InterfaceNotFound(_)));
    }
}
