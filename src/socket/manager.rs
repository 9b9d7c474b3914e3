//! Worker socket manager (protocol `0x01`)
//!
//! Opens worker sockets to known peers and accepts them from peers. Each
//! socket carries a purpose name and parameter; the acceptor hands it to the
//! [`WorkerSocketHandler`] registered for that purpose.
//!
//! Handshake bodies (JSON after the protocol byte):
//!
//! ```text
//! synchronize  { version, worker_id, audience, purpose, parameter, nonce, proof }
//! response     { result: "accepted", version, worker_id, challenge, proof }
//!            | { result: "rejected", kind, reason }
//! acknowledge  { nonce, proof }
//! ```
//!
//! `proof` in the synchronize and the response covers the initiator's nonce.
//! The acknowledge proof covers the acceptor's fresh `challenge`, so a
//! recorded exchange cannot be replayed. A prospective worker proves nothing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::WorkerSocketSettings;
use crate::error::{Error, Result};
use crate::peer::{
    authenticity_proof, new_nonce, verify_authenticity_proof, LinkKeys, PeerDirectory, WorkerId,
    PROSPECTIVE_WORKER_ID,
};
use crate::protocol::{
    framed, open_handshake, strip_code, ProtocolModule, ProtocolVersion, PROTOCOL_VERSION,
    WORKER_PROTOCOL,
};
use crate::tunnel::{InterfaceRegistry, Tunnel};

use super::WorkerSocket;

/// The only purpose a prospective worker (id 0) may open
pub const MEMBERSHIP_PURPOSE: &str = "shoal_membership";

/// Receives accepted sockets of one purpose
#[async_trait]
pub trait WorkerSocketHandler: Send + Sync {
    /// Whether `worker_id` may open a socket with this parameter
    fn authorize(&self, _worker_id: WorkerId, _parameter: &Value) -> bool {
        true
    }

    /// A socket was accepted. Reading starts when this returns, so functions
    /// defined here are in place before the first call arrives.
    async fn on_create(&self, socket: WorkerSocket);
}

// ─────────────────────────────────────────────────────────────────
// Handshake Bodies
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkerSynchronize {
    version: ProtocolVersion,
    worker_id: WorkerId,
    /// Worker the initiator means to reach; 0 when joining through an address
    audience: WorkerId,
    purpose: String,
    #[serde(default)]
    parameter: Value,
    nonce: String,
    #[serde(default)]
    proof: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Rejection {
    Version,
    Authentication,
    Audience,
    Purpose,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
enum WorkerResponse {
    Accepted {
        version: ProtocolVersion,
        worker_id: WorkerId,
        challenge: String,
        proof: String,
    },
    Rejected {
        kind: Rejection,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkerAcknowledge {
    nonce: String,
    #[serde(default)]
    proof: String,
}

// ─────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────

pub struct WorkerSocketManager {
    directory: Arc<PeerDirectory>,
    interfaces: Arc<InterfaceRegistry>,
    settings: WorkerSocketSettings,
    handlers: RwLock<HashMap<String, Arc<dyn WorkerSocketHandler>>>,
    sockets: Arc<Mutex<HashMap<u64, WorkerSocket>>>,
}

impl WorkerSocketManager {
    pub fn new(
        directory: Arc<PeerDirectory>,
        interfaces: Arc<InterfaceRegistry>,
        settings: WorkerSocketSettings,
    ) -> Self {
        Self {
            directory,
            interfaces,
            settings,
            handlers: RwLock::new(HashMap::new()),
            sockets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register the handler for sockets opened with `purpose`
    pub fn on_purpose(&self, purpose: &str, handler: Arc<dyn WorkerSocketHandler>) -> Result<()> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(purpose) {
            return Err(Error::Internal(format!(
                "purpose '{}' already has a handler",
                purpose
            )));
        }
        handlers.insert(purpose.to_string(), handler);
        Ok(())
    }

    /// Open a socket to a known peer, trying its connectors in order
    pub async fn open(
        &self,
        worker_id: WorkerId,
        purpose: &str,
        parameter: Value,
    ) -> Result<WorkerSocket> {
        let peer = self
            .directory
            .get(worker_id)
            .ok_or(Error::PeerNotFound(worker_id))?;

        let mut last_error = None;
        for connector in &peer.connectors {
            if self.interfaces.interface_id(&connector.interface).is_none() {
                debug!(worker_id, interface = %connector.interface, "No local interface for connector");
                continue;
            }
            match self
                .open_via(
                    &connector.interface,
                    &connector.settings,
                    worker_id,
                    purpose,
                    parameter.clone(),
                )
                .await
            {
                Ok(socket) => return Ok(socket),
                Err(e @ Error::AuthenticationRejected { .. })
                | Err(e @ Error::ProtocolVersion { .. }) => return Err(e),
                Err(e) => {
                    debug!(worker_id, interface = %connector.interface, error = %e, "Connector failed");
                    last_error = Some(e);
                }
            }
        }

        Err(Error::PeerUnreachable {
            worker_id,
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no usable connector".to_string()),
        })
    }

    /// Open a socket through explicit connect settings.
    ///
    /// `audience` is the worker expected on the other end, or 0 when a
    /// prospective worker joins through an address.
    pub async fn open_via(
        &self,
        interface: &str,
        connect_settings: &Value,
        audience: WorkerId,
        purpose: &str,
        parameter: Value,
    ) -> Result<WorkerSocket> {
        let my_id = self.directory.my_worker_id();
        if my_id == PROSPECTIVE_WORKER_ID && purpose != MEMBERSHIP_PURPOSE {
            return Err(Error::NotAuthenticated);
        }

        // A prospective worker has nothing to prove with or check against
        let keys: Option<LinkKeys> = if my_id == PROSPECTIVE_WORKER_ID {
            None
        } else {
            Some(
                self.directory
                    .link_keys(audience)
                    .ok_or(Error::PeerNotFound(audience))?,
            )
        };
        let nonce = new_nonce();
        let proof = keys
            .as_ref()
            .map(|k| authenticity_proof(&k.prove, &nonce, my_id, audience))
            .unwrap_or_default();
        let synchronize = WorkerSynchronize {
            version: PROTOCOL_VERSION,
            worker_id: my_id,
            audience,
            purpose: purpose.to_string(),
            parameter: parameter.clone(),
            nonce: nonce.clone(),
            proof,
        };
        let payload = framed(WORKER_PROTOCOL, &codec::encode(&synchronize)?);

        let (tunnel, remote_id) = open_handshake(
            &self.interfaces,
            interface,
            connect_settings,
            payload,
            |response| {
                let body = strip_code(WORKER_PROTOCOL, response)
                    .ok_or_else(|| Error::malformed("response is not a worker protocol message"))?;
                match codec::decode::<WorkerResponse>(body)? {
                    WorkerResponse::Rejected { kind, reason } => Err(match kind {
                        Rejection::Authentication => Error::auth_rejected(my_id, reason),
                        _ => Error::handshake_rejected(format!("{:?}: {}", kind, reason)),
                    }),
                    WorkerResponse::Accepted {
                        version,
                        worker_id,
                        challenge,
                        proof,
                    } => {
                        if version.major != PROTOCOL_VERSION.major {
                            return Err(Error::ProtocolVersion {
                                local: PROTOCOL_VERSION.to_string(),
                                remote: version.to_string(),
                            });
                        }
                        if audience != PROSPECTIVE_WORKER_ID && worker_id != audience {
                            return Err(Error::auth_rejected(
                                worker_id,
                                format!("expected worker {}", audience),
                            ));
                        }
                        if let Some(keys) = &keys {
                            if !verify_authenticity_proof(
                                &keys.verify,
                                &nonce,
                                worker_id,
                                my_id,
                                &proof,
                            ) {
                                return Err(Error::auth_rejected(
                                    worker_id,
                                    "invalid authenticity proof",
                                ));
                            }
                        }
                        let ack = WorkerAcknowledge {
                            nonce: nonce.clone(),
                            proof: keys
                                .as_ref()
                                .map(|k| authenticity_proof(&k.prove, &challenge, my_id, worker_id))
                                .unwrap_or_default(),
                        };
                        Ok((framed(WORKER_PROTOCOL, &codec::encode(&ack)?), worker_id))
                    }
                }
            },
        )
        .await?;

        let socket = WorkerSocket::new(
            tunnel,
            purpose.to_string(),
            parameter,
            remote_id,
            self.settings.max_frame_bytes,
        );
        socket.start();
        self.track(&socket);
        info!(
            socket = socket.id(),
            remote_worker_id = remote_id,
            purpose,
            "Worker socket opened"
        );
        Ok(socket)
    }

    /// Open sockets
    pub fn sockets(&self) -> Vec<WorkerSocket> {
        self.sockets.lock().values().cloned().collect()
    }

    /// Open sockets with one peer
    pub fn sockets_with(&self, worker_id: WorkerId) -> Vec<WorkerSocket> {
        self.sockets
            .lock()
            .values()
            .filter(|s| s.remote_worker_id() == worker_id)
            .cloned()
            .collect()
    }

    pub fn close_all(&self) {
        for socket in self.sockets() {
            socket.close();
        }
    }

    fn track(&self, socket: &WorkerSocket) {
        self.sockets.lock().insert(socket.id(), socket.clone());
        let sockets = Arc::clone(&self.sockets);
        let socket = socket.clone();
        tokio::spawn(async move {
            socket.closed().await;
            sockets.lock().remove(&socket.id());
        });
    }

    /// Acceptor-side checks on a synchronize body
    fn admit(&self, sync: &WorkerSynchronize) -> std::result::Result<(), (Rejection, String)> {
        PROTOCOL_VERSION
            .ensure_compatible(&sync.version)
            .map_err(|e| (Rejection::Version, e.to_string()))?;

        let my_id = self.directory.my_worker_id();
        let joining = sync.purpose == MEMBERSHIP_PURPOSE;
        if sync.audience != my_id && !(joining && sync.audience == PROSPECTIVE_WORKER_ID) {
            return Err((
                Rejection::Audience,
                format!("this is worker {}, not {}", my_id, sync.audience),
            ));
        }

        let handler = self
            .handlers
            .read()
            .get(&sync.purpose)
            .cloned()
            .ok_or_else(|| {
                (
                    Rejection::Purpose,
                    format!("no handler for purpose '{}'", sync.purpose),
                )
            })?;

        if sync.worker_id == PROSPECTIVE_WORKER_ID {
            if !joining {
                return Err((
                    Rejection::Authentication,
                    "a prospective worker may only join".to_string(),
                ));
            }
        } else {
            let keys = self.directory.link_keys(sync.worker_id).ok_or_else(|| {
                (
                    Rejection::Authentication,
                    format!("unknown worker {}", sync.worker_id),
                )
            })?;
            if !verify_authenticity_proof(
                &keys.verify,
                &sync.nonce,
                sync.worker_id,
                sync.audience,
                &sync.proof,
            ) {
                return Err((
                    Rejection::Authentication,
                    "invalid authenticity proof".to_string(),
                ));
            }
        }

        if !handler.authorize(sync.worker_id, &sync.parameter) {
            return Err((
                Rejection::Purpose,
                format!("purpose '{}' refused this worker", sync.purpose),
            ));
        }
        Ok(())
    }

    /// The acknowledge echoes the nonce and, from a member, proves itself over our challenge
    fn acknowledge_matches(
        &self,
        sync: &WorkerSynchronize,
        response: &[u8],
        acknowledge: &[u8],
    ) -> bool {
        let challenge = match strip_code(WORKER_PROTOCOL, response)
            .and_then(|body| codec::decode::<WorkerResponse>(body).ok())
        {
            Some(WorkerResponse::Accepted { challenge, .. }) => challenge,
            _ => return false,
        };
        let Some(ack) = strip_code(WORKER_PROTOCOL, acknowledge)
            .and_then(|body| codec::decode::<WorkerAcknowledge>(body).ok())
        else {
            return false;
        };
        if ack.nonce != sync.nonce {
            return false;
        }
        if sync.worker_id == PROSPECTIVE_WORKER_ID {
            return true;
        }
        self.directory
            .link_keys(sync.worker_id)
            .is_some_and(|keys| {
                verify_authenticity_proof(
                    &keys.verify,
                    &challenge,
                    sync.worker_id,
                    self.directory.my_worker_id(),
                    &ack.proof,
                )
            })
    }

    fn decode_synchronize(payload: &[u8]) -> Option<WorkerSynchronize> {
        let body = strip_code(WORKER_PROTOCOL, payload)?;
        match codec::decode(body) {
            Ok(sync) => Some(sync),
            Err(e) => {
                debug!(error = %e, "Undecodable worker synchronize");
                None
            }
        }
    }
}

#[async_trait]
impl ProtocolModule for WorkerSocketManager {
    fn protocol_code(&self) -> u8 {
        WORKER_PROTOCOL
    }

    fn name(&self) -> &'static str {
        "worker"
    }

    async fn synchronize(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let sync = Self::decode_synchronize(payload)?;
        let response = match self.admit(&sync) {
            Ok(()) => {
                let my_id = self.directory.my_worker_id();
                let proof = self
                    .directory
                    .link_keys(sync.worker_id)
                    .map(|k| authenticity_proof(&k.prove, &sync.nonce, my_id, sync.worker_id))
                    .unwrap_or_default();
                WorkerResponse::Accepted {
                    version: PROTOCOL_VERSION,
                    worker_id: my_id,
                    challenge: new_nonce(),
                    proof,
                }
            }
            Err((kind, reason)) => {
                warn!(
                    worker_id = sync.worker_id,
                    purpose = %sync.purpose,
                    kind = ?kind,
                    reason = %reason,
                    "Worker socket rejected"
                );
                WorkerResponse::Rejected { kind, reason }
            }
        };
        codec::encode(&response)
            .ok()
            .map(|body| framed(WORKER_PROTOCOL, &body))
    }

    async fn acknowledge(
        &self,
        synchronize: Vec<u8>,
        response: Vec<u8>,
        acknowledge: Vec<u8>,
        tunnel: Tunnel,
    ) {
        let Some(sync) = Self::decode_synchronize(&synchronize) else {
            tunnel.close();
            return;
        };
        // A rejected initiator must not get a socket by acknowledging anyway
        if self.admit(&sync).is_err() {
            tunnel.close();
            return;
        }
        if !self.acknowledge_matches(&sync, &response, &acknowledge) {
            warn!(worker_id = sync.worker_id, "Acknowledge does not answer our challenge");
            tunnel.close();
            return;
        }
        let Some(handler) = self.handlers.read().get(&sync.purpose).cloned() else {
            tunnel.close();
            return;
        };

        let socket = WorkerSocket::new(
            tunnel,
            sync.purpose.clone(),
            sync.parameter,
            sync.worker_id,
            self.settings.max_frame_bytes,
        );
        self.track(&socket);
        handler.on_create(socket.clone()).await;
        socket.start();
        info!(
            socket = socket.id(),
            remote_worker_id = sync.worker_id,
            purpose = %sync.purpose,
            "Worker socket accepted"
        );
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc;

    use crate::peer::WorkerPeer;
    use crate::tunnel::memory_pair;

    #[derive(Default)]
    struct Counting {
        created: AtomicUsize,
    }

    #[async_trait]
    impl WorkerSocketHandler for Counting {
        async fn on_create(&self, _socket: WorkerSocket) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn secret(id: WorkerId) -> Vec<u8> {
        vec![id as u8; 32]
    }

    /// Worker 2, knowing worker 1, serving the purpose `jobs`
    fn acceptor(handler: Arc<Counting>) -> WorkerSocketManager {
        let directory = Arc::new(PeerDirectory::new());
        directory.import_my_identity(2, secret(2));
        let one = WorkerPeer {
            worker_id: 1,
            connectors: Vec::new(),
            detail: Value::Null,
            authenticity_data: secret(1),
            pairwise_key: Vec::new(),
        };
        directory.import_peers([(1, one)].into()).unwrap();
        let (accepted, _) = mpsc::channel(1);
        let manager = WorkerSocketManager::new(
            directory,
            Arc::new(InterfaceRegistry::new(accepted)),
            WorkerSocketSettings::default(),
        );
        manager.on_purpose("jobs", handler).unwrap();
        manager
    }

    fn synchronize_from_one(nonce: &str) -> Vec<u8> {
        let sync = WorkerSynchronize {
            version: PROTOCOL_VERSION,
            worker_id: 1,
            audience: 2,
            purpose: "jobs".to_string(),
            parameter: Value::Null,
            nonce: nonce.to_string(),
            proof: authenticity_proof(&secret(1), nonce, 1, 2),
        };
        framed(WORKER_PROTOCOL, &codec::encode(&sync).unwrap())
    }

    fn challenge_of(response: &[u8]) -> String {
        let body = strip_code(WORKER_PROTOCOL, response).unwrap();
        match codec::decode::<WorkerResponse>(body).unwrap() {
            WorkerResponse::Accepted { challenge, .. } => challenge,
            other => panic!("synchronize refused: {:?}", other),
        }
    }

    fn acknowledge_from_one(nonce: &str, proof: String) -> Vec<u8> {
        let ack = WorkerAcknowledge {
            nonce: nonce.to_string(),
            proof,
        };
        framed(WORKER_PROTOCOL, &codec::encode(&ack).unwrap())
    }

    #[tokio::test]
    async fn test_replayed_exchange_opens_nothing() {
        let handler = Arc::new(Counting::default());
        let manager = acceptor(Arc::clone(&handler));
        let sync = synchronize_from_one("n-1");

        let response = manager.synchronize(&sync).await.unwrap();
        let challenge = challenge_of(&response);
        let ack = acknowledge_from_one("n-1", authenticity_proof(&secret(1), &challenge, 1, 2));
        let (_initiator, tunnel) = memory_pair("mem", None);
        manager
            .acknowledge(sync.clone(), response, ack.clone(), tunnel)
            .await;
        assert_eq!(handler.created.load(Ordering::SeqCst), 1);

        // The recorded pair again, each time on a fresh tunnel
        for _ in 0..3 {
            let response = manager.synchronize(&sync).await.unwrap();
            assert_ne!(challenge_of(&response), challenge);
            let (mut initiator, tunnel) = memory_pair("mem", None);
            manager
                .acknowledge(sync.clone(), response, ack.clone(), tunnel)
                .await;
            assert_eq!(initiator.next_event().await, None);
        }
        assert_eq!(handler.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_acknowledge_must_prove_over_challenge() {
        let handler = Arc::new(Counting::default());
        let manager = acceptor(Arc::clone(&handler));
        let sync = synchronize_from_one("n-2");
        let response = manager.synchronize(&sync).await.unwrap();

        // Echoing the nonce without a proof, or proving over our own nonce
        for proof in [String::new(), authenticity_proof(&secret(1), "n-2", 1, 2)] {
            let (_initiator, tunnel) = memory_pair("mem", None);
            manager
                .acknowledge(
                    sync.clone(),
                    response.clone(),
                    acknowledge_from_one("n-2", proof),
                    tunnel,
                )
                .await;
        }
        assert_eq!(handler.created.load(Ordering::SeqCst), 0);
        assert!(manager.sockets().is_empty());
    }

    #[tokio::test]
    async fn test_synchronize_with_forged_proof_rejected() {
        let manager = acceptor(Arc::new(Counting::default()));
        let mut sync: WorkerSynchronize =
            codec::decode(strip_code(WORKER_PROTOCOL, &synchronize_from_one("n-3")).unwrap())
                .unwrap();
        sync.proof = authenticity_proof(&secret(9), "n-3", 1, 2);
        let payload = framed(WORKER_PROTOCOL, &codec::encode(&sync).unwrap());

        let response = manager.synchronize(&payload).await.unwrap();
        let body = strip_code(WORKER_PROTOCOL, &response).unwrap();
        assert!(matches!(
            codec::decode::<WorkerResponse>(body).unwrap(),
            WorkerResponse::Rejected {
                kind: Rejection::Authentication,
                ..
            }
        ));
    }
}
