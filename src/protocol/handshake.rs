//! Two-stage handshake over a fresh tunnel
//!
//! ```text
//! initiator                          acceptor
//!   Synchronizing  ── synchronize ──▶  Synchronizing
//!                  ◀── response ────   (a module claims) ─▶ Acknowledging
//!   Acknowledging  ── acknowledge ─▶
//!   Finished                           Finished (tunnel handed to the module)
//! ```
//!
//! Both sides track their stage in a [`Handshake`]; an event that is not valid
//! in the current stage is refused instead of acted upon.

use std::fmt;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::seed::GlobalSeed;
use crate::tunnel::{InterfaceRegistry, Tunnel, TunnelEvent};

use super::ProtocolRegistry;

// ─────────────────────────────────────────────────────────────────
// Stage Machine
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Acceptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    Synchronizing,
    Acknowledging,
    Finished,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// Initiator: the acceptor's response arrived
    ResponseReceived,
    /// Initiator: our acknowledge payload was written
    AcknowledgeSent,
    /// Acceptor: a module claimed the tunnel and its response was written
    ClaimSent,
    /// Acceptor: the initiator's acknowledge payload arrived
    AcknowledgeReceived,
    /// Either side: the exchange was refused
    Rejected,
    /// Either side: transport error or close
    TransportFailed,
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for HandshakeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Transition table
pub fn transition(
    role: HandshakeRole,
    stage: HandshakeStage,
    event: HandshakeEvent,
) -> Result<HandshakeStage> {
    use HandshakeEvent::*;
    use HandshakeRole::*;
    use HandshakeStage::*;

    let next = match (role, stage, event) {
        (Initiator, Synchronizing, ResponseReceived) => Acknowledging,
        (Initiator, Acknowledging, AcknowledgeSent) => Finished,
        (Acceptor, Synchronizing, ClaimSent) => Acknowledging,
        (Acceptor, Acknowledging, AcknowledgeReceived) => Finished,
        (_, Synchronizing | Acknowledging, Rejected | TransportFailed) => Aborted,
        _ => {
            return Err(Error::HandshakeStage {
                stage: stage.to_string(),
                event: event.to_string(),
            })
        }
    };
    Ok(next)
}

/// Stage tracker for one handshake attempt
#[derive(Debug)]
pub struct Handshake {
    role: HandshakeRole,
    stage: HandshakeStage,
    tunnel: u64,
}

impl Handshake {
    pub fn new(role: HandshakeRole, tunnel: u64) -> Self {
        Self {
            role,
            stage: HandshakeStage::Synchronizing,
            tunnel,
        }
    }

    pub fn stage(&self) -> HandshakeStage {
        self.stage
    }

    pub fn advance(&mut self, event: HandshakeEvent) -> Result<HandshakeStage> {
        let next = transition(self.role, self.stage, event)?;
        debug!(
            tunnel = self.tunnel,
            role = ?self.role,
            from = %self.stage,
            to = %next,
            "Handshake stage"
        );
        self.stage = next;
        Ok(next)
    }

    /// Abort, close the tunnel and hand back `error`
    fn abort(&mut self, tunnel: &Tunnel, event: HandshakeEvent, error: Error) -> Error {
        if let Err(stage_error) = self.advance(event) {
            warn!(tunnel = self.tunnel, error = %stage_error, "Abort outside handshake");
        }
        tunnel.close();
        error
    }
}

fn event_failure(event: Option<TunnelEvent>, interface: &str) -> Error {
    match event {
        Some(TunnelEvent::Error(message)) => Error::transport(interface, message),
        _ => Error::TunnelClosed,
    }
}

// ─────────────────────────────────────────────────────────────────
// Initiator
// ─────────────────────────────────────────────────────────────────

/// Open a tunnel and run the initiator side of the handshake.
///
/// `acknowledge` receives the acceptor's response and either returns the
/// acknowledge payload plus a value for the caller, or an error that rejects
/// the handshake. On success the live tunnel is handed to the caller.
pub async fn open_handshake<T, F>(
    interfaces: &InterfaceRegistry,
    interface: &str,
    connect_settings: &Value,
    synchronize: Vec<u8>,
    acknowledge: F,
) -> Result<(Tunnel, T)>
where
    F: FnOnce(&[u8]) -> Result<(Vec<u8>, T)>,
{
    let mut tunnel = interfaces.create_tunnel(interface, connect_settings).await?;
    let mut handshake = Handshake::new(HandshakeRole::Initiator, tunnel.id());

    if let Err(e) = tunnel.send(synchronize).await {
        return Err(handshake.abort(&tunnel, HandshakeEvent::TransportFailed, e));
    }

    let response = match tunnel.next_event().await {
        Some(TunnelEvent::Data(bytes)) => bytes,
        other => {
            let e = event_failure(other, interface);
            return Err(handshake.abort(&tunnel, HandshakeEvent::TransportFailed, e));
        }
    };
    handshake.advance(HandshakeEvent::ResponseReceived)?;

    let (ack, value) = match acknowledge(&response) {
        Ok(accepted) => accepted,
        Err(e) => {
            debug!(tunnel = tunnel.id(), error = %e, "Handshake response rejected");
            return Err(handshake.abort(&tunnel, HandshakeEvent::Rejected, e));
        }
    };

    if let Err(e) = tunnel.send(ack).await {
        return Err(handshake.abort(&tunnel, HandshakeEvent::TransportFailed, e));
    }
    handshake.advance(HandshakeEvent::AcknowledgeSent)?;
    Ok((tunnel, value))
}

// ─────────────────────────────────────────────────────────────────
// Acceptor
// ─────────────────────────────────────────────────────────────────

/// Runs the acceptor side for every tunnel accepted by local listeners
pub struct HandshakeCoordinator {
    registry: Arc<ProtocolRegistry>,
    seed: Arc<GlobalSeed>,
}

impl HandshakeCoordinator {
    pub fn new(registry: Arc<ProtocolRegistry>, seed: Arc<GlobalSeed>) -> Self {
        Self { registry, seed }
    }

    /// Consume accepted tunnels until the channel closes
    pub async fn run(self: Arc<Self>, mut accepted: mpsc::Receiver<Tunnel>) {
        while let Some(tunnel) = accepted.recv().await {
            if tunnel.attributes().from_connector {
                debug!(tunnel = tunnel.id(), "Skipping locally opened tunnel");
                continue;
            }
            let coordinator = Arc::clone(&self);
            tokio::spawn(async move {
                let id = tunnel.id();
                if let Err(e) = coordinator.accept(tunnel).await {
                    info!(tunnel = id, error = %e, "Handshake not completed");
                }
            });
        }
        debug!("Accept channel closed, handshake coordinator stopping");
    }

    /// Run one acceptor handshake; returns the code of the module that took the tunnel
    pub async fn accept(&self, mut tunnel: Tunnel) -> Result<u8> {
        let interface = tunnel.attributes().interface.clone();
        let mut handshake = Handshake::new(HandshakeRole::Acceptor, tunnel.id());

        let synchronize = match tunnel.next_event().await {
            Some(TunnelEvent::Data(bytes)) => bytes,
            other => {
                let e = event_failure(other, &interface);
                return Err(handshake.abort(&tunnel, HandshakeEvent::TransportFailed, e));
            }
        };

        let (code, response) = match self.claim(tunnel.id(), &synchronize).await {
            Some(claim) => claim,
            None => {
                let e = Error::handshake_rejected("no protocol claimed the tunnel");
                return Err(handshake.abort(&tunnel, HandshakeEvent::Rejected, e));
            }
        };

        if let Err(e) = tunnel.send(response.clone()).await {
            return Err(handshake.abort(&tunnel, HandshakeEvent::TransportFailed, e));
        }
        handshake.advance(HandshakeEvent::ClaimSent)?;

        let acknowledge = match tunnel.next_event().await {
            Some(TunnelEvent::Data(bytes)) => bytes,
            other => {
                let e = event_failure(other, &interface);
                return Err(handshake.abort(&tunnel, HandshakeEvent::TransportFailed, e));
            }
        };
        handshake.advance(HandshakeEvent::AcknowledgeReceived)?;

        let module = self
            .registry
            .module(code)
            .ok_or_else(|| Error::Internal(format!("protocol {:#04x} vanished", code)))?;
        info!(tunnel = tunnel.id(), protocol = module.name(), "Tunnel handed to protocol");
        module
            .acknowledge(synchronize, response, acknowledge, tunnel)
            .await;
        Ok(code)
    }

    /// Offer the payload to every module at once and settle on one claimant
    async fn claim(&self, tunnel: u64, payload: &[u8]) -> Option<(u8, Vec<u8>)> {
        let offers = self.registry.modules().map(|module| async move {
            let response = module.synchronize(payload).await;
            (module.protocol_code(), response)
        });
        let mut claims: Vec<(u8, Vec<u8>)> = join_all(offers)
            .await
            .into_iter()
            .filter_map(|(code, response)| match response {
                Some(bytes) if !bytes.is_empty() => Some((code, bytes)),
                _ => None,
            })
            .collect();

        if claims.len() <= 1 {
            return claims.pop();
        }

        // Modules come out in code order, which is the canonical order for the draw
        let codes: Vec<u8> = claims.iter().map(|(code, _)| *code).collect();
        let conflict = Error::DuplicateClaim {
            codes: codes.clone(),
        };
        warn!(tunnel, error = %conflict, "Several protocols claimed one tunnel");

        let winner = match self.seed.stream("handshake-claim") {
            Ok(mut random) => random.index(claims.len()),
            Err(_) => 0,
        };
        Some(claims.swap_remove(winner))
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{framed, strip_code, ProtocolModule};
    use crate::seed::SEED_LEN;
    use crate::tunnel::memory_pair;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Echo {
        code: u8,
        greedy: bool,
        received: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
        responses: Mutex<Vec<Vec<u8>>>,
    }

    impl Echo {
        fn new(code: u8) -> Arc<Self> {
            Arc::new(Self {
                code,
                greedy: false,
                received: Mutex::new(Vec::new()),
                responses: Mutex::new(Vec::new()),
            })
        }

        /// Claims every payload regardless of its code
        fn greedy(code: u8) -> Arc<Self> {
            Arc::new(Self {
                code,
                greedy: true,
                received: Mutex::new(Vec::new()),
                responses: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ProtocolModule for Echo {
        fn protocol_code(&self) -> u8 {
            self.code
        }
        fn name(&self) -> &'static str {
            "echo"
        }
        async fn synchronize(&self, payload: &[u8]) -> Option<Vec<u8>> {
            if self.greedy {
                return Some(vec![self.code]);
            }
            strip_code(self.code, payload).map(|body| framed(self.code, body))
        }
        async fn acknowledge(
            &self,
            sync: Vec<u8>,
            response: Vec<u8>,
            ack: Vec<u8>,
            _tunnel: Tunnel,
        ) {
            self.responses.lock().push(response);
            self.received.lock().push((sync, ack));
        }
    }

    fn coordinator_with_seed(modules: Vec<Arc<Echo>>, seed: GlobalSeed) -> HandshakeCoordinator {
        let mut builder = ProtocolRegistry::builder();
        for module in modules {
            builder = builder.register(module).unwrap();
        }
        HandshakeCoordinator::new(Arc::new(builder.build()), Arc::new(seed))
    }

    fn coordinator(modules: Vec<Arc<Echo>>) -> HandshakeCoordinator {
        coordinator_with_seed(modules, GlobalSeed::new())
    }

    #[test]
    fn test_transition_table() {
        use HandshakeEvent::*;
        use HandshakeRole::*;
        use HandshakeStage::*;

        assert_eq!(
            transition(Initiator, Synchronizing, ResponseReceived).unwrap(),
            Acknowledging
        );
        assert_eq!(
            transition(Acceptor, Acknowledging, AcknowledgeReceived).unwrap(),
            Finished
        );
        assert_eq!(
            transition(Acceptor, Synchronizing, TransportFailed).unwrap(),
            Aborted
        );
        // Out of stage or out of role
        assert!(transition(Initiator, Synchronizing, AcknowledgeSent).is_err());
        assert!(transition(Initiator, Synchronizing, ClaimSent).is_err());
        assert!(transition(Acceptor, Finished, AcknowledgeReceived).is_err());
        assert!(transition(Acceptor, Aborted, TransportFailed).is_err());
    }

    #[test]
    fn test_stage_never_repeats() {
        let mut handshake = Handshake::new(HandshakeRole::Initiator, 1);
        handshake.advance(HandshakeEvent::ResponseReceived).unwrap();
        let err = handshake
            .advance(HandshakeEvent::ResponseReceived)
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeStage { .. }));
        assert_eq!(handshake.stage(), HandshakeStage::Acknowledging);
    }

    #[tokio::test]
    async fn test_accept_hands_tunnel_to_claimant() {
        let worker = Echo::new(1);
        let group = Echo::new(2);
        let coordinator = coordinator(vec![Arc::clone(&worker), Arc::clone(&group)]);

        let (mut initiator, acceptor) = memory_pair("mem", None);
        let task = tokio::spawn(async move { coordinator.accept(acceptor).await });

        initiator.send(vec![2, 7]).await.unwrap();
        assert_eq!(
            initiator.next_event().await,
            Some(TunnelEvent::Data(vec![2, 7]))
        );
        initiator.send(b"ack".to_vec()).await.unwrap();

        assert_eq!(task.await.unwrap().unwrap(), 2);
        assert_eq!(group.received.lock().as_slice(), &[(vec![2, 7], b"ack".to_vec())]);
        // The module sees the response it claimed with
        assert_eq!(group.responses.lock().as_slice(), &[vec![2, 7]]);
        assert!(worker.received.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unclaimed_tunnel_is_closed() {
        let worker = Echo::new(1);
        let coordinator = coordinator(vec![Arc::clone(&worker)]);

        let (mut initiator, acceptor) = memory_pair("mem", None);
        let task = tokio::spawn(async move { coordinator.accept(acceptor).await });

        initiator.send(vec![9]).await.unwrap();
        assert_eq!(initiator.next_event().await, None);
        assert!(matches!(
            task.await.unwrap(),
            Err(Error::HandshakeRejected { .. })
        ));
        assert!(worker.received.lock().is_empty());
    }

    #[tokio::test]
    async fn test_close_before_acknowledge() {
        let worker = Echo::new(1);
        let coordinator = coordinator(vec![Arc::clone(&worker)]);

        let (mut initiator, acceptor) = memory_pair("mem", None);
        let task = tokio::spawn(async move { coordinator.accept(acceptor).await });

        initiator.send(vec![1]).await.unwrap();
        assert!(initiator.next_event().await.is_some());
        initiator.close();

        assert!(matches!(task.await.unwrap(), Err(Error::TunnelClosed)));
        assert!(worker.received.lock().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_claim_settled_by_seed() {
        let bytes: Vec<u8> = (0..SEED_LEN).map(|i| (i * 7 % 251) as u8).collect();
        let mut winners = Vec::new();

        for _ in 0..2 {
            let first = Echo::greedy(1);
            let second = Echo::greedy(2);
            let seed = GlobalSeed::new();
            seed.import(&bytes).unwrap();
            let coordinator =
                coordinator_with_seed(vec![Arc::clone(&first), Arc::clone(&second)], seed);

            let (mut initiator, acceptor) = memory_pair("mem", None);
            let task = tokio::spawn(async move { coordinator.accept(acceptor).await });

            initiator.send(vec![0]).await.unwrap();
            assert!(initiator.next_event().await.is_some());
            initiator.send(b"ack".to_vec()).await.unwrap();

            let code = task.await.unwrap().unwrap();
            let taken = first.received.lock().len() + second.received.lock().len();
            assert_eq!(taken, 1);
            winners.push(code);
        }

        // Same seed, same winner
        assert_eq!(winners[0], winners[1]);
    }
}
