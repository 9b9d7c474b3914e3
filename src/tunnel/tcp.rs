//! TCP transport
//!
//! One TCP connection per tunnel, with a reader task and a writer task.
//! Settings: `{"host": "10.0.0.2", "port": 9100}` or `{"address": "10.0.0.2:9100"}`.
//!
//! Wire format:  [4-byte big-endian length][payload]

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

use super::{Outbound, Transport, Tunnel, TunnelAttributes, TunnelEvent};

const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransport {
    /// Timeout for establishing connections
    pub connect_timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

fn socket_addr(interface: &str, settings: &Value) -> Result<String> {
    if let Some(address) = settings.get("address").and_then(Value::as_str) {
        return Ok(address.to_string());
    }
    let host = settings
        .get("host")
        .and_then(Value::as_str)
        .unwrap_or("0.0.0.0");
    let port = settings
        .get("port")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::transport(interface, "tcp settings need 'address' or 'port'"))?;
    Ok(format!("{}:{}", host, port))
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    async fn listen(
        &self,
        interface: &str,
        settings: &Value,
        accepted: mpsc::Sender<Tunnel>,
    ) -> Result<()> {
        let bind_addr = socket_addr(interface, settings)?;
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| Error::transport(interface, format!("bind {}: {}", bind_addr, e)))?;
        let addr = listener.local_addr()?;
        info!(interface, addr = %addr, "TCP interface listening");

        let interface = interface.to_string();
        tokio::spawn(async move {
            accept_loop(interface, listener, accepted).await;
        });
        Ok(())
    }

    async fn connect(&self, interface: &str, settings: &Value) -> Result<Tunnel> {
        let addr = socket_addr(interface, settings)?;
        debug!(interface, addr = %addr, "Connecting");

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::transport(interface, format!("connect to {} timed out", addr)))?
            .map_err(|e| Error::transport(interface, format!("connect to {}: {}", addr, e)))?;

        Ok(spawn_stream_tunnel(
            stream,
            TunnelAttributes::connector(interface, Some(addr)),
        ))
    }
}

/// Accept incoming connections and hand them over as tunnels
async fn accept_loop(interface: String, listener: TcpListener, accepted: mpsc::Sender<Tunnel>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!(interface = %interface, peer_addr = %peer_addr, "Incoming connection");
                let tunnel = spawn_stream_tunnel(
                    stream,
                    TunnelAttributes::listener(&interface, Some(peer_addr.to_string())),
                );
                if accepted.send(tunnel).await.is_err() {
                    info!(interface = %interface, "Accept channel closed, stopping listener");
                    break;
                }
            }
            Err(e) => {
                error!(interface = %interface, error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Wrap a connected stream in a tunnel backed by a reader and a writer task
fn spawn_stream_tunnel(stream: TcpStream, attributes: TunnelAttributes) -> Tunnel {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();

    let tunnel = Tunnel::from_channels(attributes, out_tx, in_rx);
    let id = tunnel.id();

    let reader = tokio::spawn(async move {
        read_loop(id, read_half, in_tx).await;
    });
    tokio::spawn(async move {
        write_loop(id, write_half, out_rx, reader).await;
    });

    tunnel
}

/// Read a length-prefixed frame from a stream
async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> anyhow::Result<Vec<u8>> {
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_SIZE {
        return Err(anyhow::anyhow!(
            "Frame too large: {} bytes (max {})",
            len,
            MAX_FRAME_SIZE
        ));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write a length-prefixed frame to a stream
async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> anyhow::Result<()> {
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(anyhow::anyhow!("Frame too large: {} bytes", payload.len()));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Background task: forwards frames as tunnel events until EOF or error
async fn read_loop(
    tunnel: u64,
    mut reader: tokio::net::tcp::OwnedReadHalf,
    events: mpsc::UnboundedSender<TunnelEvent>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => {
                if events.send(TunnelEvent::Data(frame)).is_err() {
                    break;
                }
            }
            Err(e) => {
                let eof = e
                    .downcast_ref::<std::io::Error>()
                    .map(|io| io.kind() == std::io::ErrorKind::UnexpectedEof)
                    .unwrap_or(false);
                if !eof {
                    debug!(tunnel, error = %e, "Tunnel read error");
                    let _ = events.send(TunnelEvent::Error(e.to_string()));
                }
                break;
            }
        }
    }
}

/// Background task: writes queued frames; a close or write error ends the tunnel
async fn write_loop(
    tunnel: u64,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    reader: tokio::task::JoinHandle<()>,
) {
    while let Some(msg) = outbound.recv().await {
        match msg {
            Outbound::Data(payload, done) => {
                let result = write_frame(&mut writer, &payload).await;
                let ok = result.is_ok();
                if let Some(done) = done {
                    let _ = done.send(ok);
                }
                if let Err(e) = result {
                    debug!(tunnel, error = %e, "Tunnel write error");
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = writer.shutdown().await;
    reader.abort();
    debug!(tunnel, "Tunnel writer stopped");
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
