//! In-process transport
//!
//! Listeners register an address on a shared [`MemoryNetwork`]; connecting to
//! that address creates a linked tunnel pair and hands the listener half to
//! the listener's accept channel. A single pump task forwards both directions
//! and ends on close from either side, which closes both halves.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::{Outbound, Transport, Tunnel, TunnelAttributes, TunnelEvent};

/// Create a connected pair: `(connector side, listener side)`
pub fn memory_pair(interface: &str, remote_address: Option<String>) -> (Tunnel, Tunnel) {
    let (a_out_tx, a_out_rx) = mpsc::unbounded_channel();
    let (b_out_tx, b_out_rx) = mpsc::unbounded_channel();
    let (a_in_tx, a_in_rx) = mpsc::unbounded_channel();
    let (b_in_tx, b_in_rx) = mpsc::unbounded_channel();

    let a = Tunnel::from_channels(
        TunnelAttributes::connector(interface, remote_address),
        a_out_tx,
        a_in_rx,
    );
    let b = Tunnel::from_channels(TunnelAttributes::listener(interface, None), b_out_tx, b_in_rx);

    tokio::spawn(pump(a_out_rx, b_out_rx, a_in_tx, b_in_tx));
    (a, b)
}

async fn pump(
    mut a_out: mpsc::UnboundedReceiver<Outbound>,
    mut b_out: mpsc::UnboundedReceiver<Outbound>,
    a_in: mpsc::UnboundedSender<TunnelEvent>,
    b_in: mpsc::UnboundedSender<TunnelEvent>,
) {
    loop {
        let keep_going = tokio::select! {
            msg = a_out.recv() => forward(msg, &b_in),
            msg = b_out.recv() => forward(msg, &a_in),
        };
        if !keep_going {
            break;
        }
    }
    // Dropping both inbound senders ends both event streams
}

fn forward(msg: Option<Outbound>, to: &mpsc::UnboundedSender<TunnelEvent>) -> bool {
    match msg {
        Some(Outbound::Data(bytes, done)) => {
            let delivered = to.send(TunnelEvent::Data(bytes)).is_ok();
            if let Some(done) = done {
                let _ = done.send(delivered);
            }
            delivered
        }
        Some(Outbound::Close) | None => false,
    }
}

/// Address book shared by every [`MemoryTransport`] in the process
#[derive(Default)]
pub struct MemoryNetwork {
    listeners: Mutex<HashMap<String, mpsc::Sender<Tunnel>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stop accepting on an address
    pub fn unlisten(&self, address: &str) {
        self.listeners.lock().remove(address);
    }
}

/// Transport over a [`MemoryNetwork`]; settings are `{"address": "<name>"}`
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    pub fn new(network: Arc<MemoryNetwork>) -> Self {
        Self { network }
    }
}

fn address_of(interface: &str, settings: &Value) -> Result<String> {
    settings
        .get("address")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::transport(interface, "memory settings need an 'address'"))
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn listen(
        &self,
        interface: &str,
        settings: &Value,
        accepted: mpsc::Sender<Tunnel>,
    ) -> Result<()> {
        let address = address_of(interface, settings)?;
        let mut listeners = self.network.listeners.lock();
        if listeners.contains_key(&address) {
            return Err(Error::transport(
                interface,
                format!("address '{}' already in use", address),
            ));
        }
        info!(interface, address = %address, "Memory interface listening");
        listeners.insert(address, accepted);
        Ok(())
    }

    async fn connect(&self, interface: &str, settings: &Value) -> Result<Tunnel> {
        let address = address_of(interface, settings)?;
        let listener = self
            .network
            .listeners
            .lock()
            .get(&address)
            .cloned()
            .ok_or_else(|| Error::transport(interface, format!("nothing listening on '{}'", address)))?;

        let (local, remote) = memory_pair(interface, Some(address.clone()));
        listener
            .send(remote)
            .await
            .map_err(|_| Error::transport(interface, format!("listener '{}' is gone", address)))?;
        debug!(interface, address = %address, tunnel = local.id(), "Memory tunnel opened");
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_connect_reaches_listener() {
        let network = MemoryNetwork::new();
        let transport = MemoryTransport::new(Arc::clone(&network));
        let (tx, mut rx) = mpsc::channel(4);

        transport
            .listen("mem", &json!({ "address": "w1" }), tx)
            .await
            .unwrap();
        let client = transport
            .connect("mem", &json!({ "address": "w1" }))
            .await
            .unwrap();
        let mut server = rx.recv().await.unwrap();

        assert!(client.attributes().from_connector);
        assert!(!server.attributes().from_connector);

        client.send(vec![9]).await.unwrap();
        assert_eq!(server.next_event().await, Some(TunnelEvent::Data(vec![9])));
    }

    #[tokio::test]
    async fn test_connect_without_listener() {
        let transport = MemoryTransport::new(MemoryNetwork::new());
        let result = transport.connect("mem", &json!({ "address": "ghost" })).await;
        assert!(matches!(result, Err(Error::Transport { .. })));
    }

    #[tokio::test]
    async fn test_duplicate_listen() {
        let transport = MemoryTransport::new(MemoryNetwork::new());
        let (tx, _rx) = mpsc::channel(1);
        transport
            .listen("mem", &json!({ "address": "w1" }), tx.clone())
            .await
            .unwrap();
        assert!(transport
            .listen("mem", &json!({ "address": "w1" }), tx)
            .await
            .is_err());
    }
}
