//! Worker group manager (protocol `0x02`)
//!
//! Creates channels, and learns of channels other members created when their
//! first link arrives. A link is a tunnel handshaken under `0x02`; its
//! synchronize carries the channel descriptor, so the acceptor can set the
//! channel up before the first request is read.
//!
//! ```text
//! synchronize  { version, worker_id, audience, channel, nonce, proof }
//! response     { result: "accepted", version, worker_id, challenge, proof }
//!            | { result: "rejected", reason }
//! acknowledge  { nonce, proof }
//! ```
//!
//! As with worker sockets, the acknowledge proves the initiator over the
//! acceptor's fresh challenge.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::GroupSettings;
use crate::error::{Error, Result};
use crate::peer::{
    authenticity_proof, new_nonce, verify_authenticity_proof, PeerDirectory, WorkerId,
    PROSPECTIVE_WORKER_ID,
};
use crate::protocol::{
    framed, open_handshake, strip_code, ProtocolModule, ProtocolVersion, PROTOCOL_VERSION,
    WORKER_GROUP_PROTOCOL,
};
use crate::seed::GlobalSeed;
use crate::tunnel::{InterfaceRegistry, Tunnel};

use super::channel::Channel;
use super::frame::{ChannelDescriptor, ChannelId};

/// Told about channels created by other members, per purpose
#[async_trait]
pub trait ChannelCreatedHandler: Send + Sync {
    /// Install the channel handler here; requests are read once this returns
    async fn on_channel_created(&self, channel: Channel);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupSynchronize {
    version: ProtocolVersion,
    worker_id: WorkerId,
    audience: WorkerId,
    channel: ChannelDescriptor,
    nonce: String,
    proof: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
enum GroupResponse {
    Accepted {
        version: ProtocolVersion,
        worker_id: WorkerId,
        challenge: String,
        proof: String,
    },
    Rejected {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupAcknowledge {
    nonce: String,
    proof: String,
}

// ─────────────────────────────────────────────────────────────────
// Shared Context
// ─────────────────────────────────────────────────────────────────

/// What every channel of one worker shares
pub(crate) struct GroupContext {
    pub(crate) directory: Arc<PeerDirectory>,
    pub(crate) interfaces: Arc<InterfaceRegistry>,
    pub(crate) seed: Arc<GlobalSeed>,
    pub(crate) settings: GroupSettings,
}

impl GroupContext {
    /// Handshake a new link to `peer` for the channel `descriptor`
    pub(crate) async fn open_link(
        &self,
        peer: WorkerId,
        descriptor: &ChannelDescriptor,
    ) -> Result<Tunnel> {
        let my_id = self.directory.my_worker_id();
        if my_id == PROSPECTIVE_WORKER_ID {
            return Err(Error::NotAuthenticated);
        }
        let target = self.directory.get(peer).ok_or(Error::PeerNotFound(peer))?;
        let keys = self
            .directory
            .link_keys(peer)
            .ok_or(Error::PeerNotFound(peer))?;

        let mut last_error = None;
        for connector in &target.connectors {
            if self.interfaces.interface_id(&connector.interface).is_none() {
                continue;
            }
            let nonce = new_nonce();
            let synchronize = GroupSynchronize {
                version: PROTOCOL_VERSION,
                worker_id: my_id,
                audience: peer,
                channel: descriptor.clone(),
                nonce: nonce.clone(),
                proof: authenticity_proof(&keys.prove, &nonce, my_id, peer),
            };
            let payload = framed(WORKER_GROUP_PROTOCOL, &codec::encode(&synchronize)?);

            let attempt = open_handshake(
                &self.interfaces,
                &connector.interface,
                &connector.settings,
                payload,
                |response| {
                    let body = strip_code(WORKER_GROUP_PROTOCOL, response)
                        .ok_or_else(|| Error::malformed("response is not a group message"))?;
                    match codec::decode::<GroupResponse>(body)? {
                        GroupResponse::Rejected { reason } => Err(Error::handshake_rejected(reason)),
                        GroupResponse::Accepted {
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
                            if worker_id != peer
                                || !verify_authenticity_proof(
                                    &keys.verify,
                                    &nonce,
                                    worker_id,
                                    my_id,
                                    &proof,
                                )
                            {
                                return Err(Error::auth_rejected(
                                    worker_id,
                                    "invalid authenticity proof",
                                ));
                            }
                            let ack = GroupAcknowledge {
                                nonce: nonce.clone(),
                                proof: authenticity_proof(&keys.prove, &challenge, my_id, peer),
                            };
                            Ok((framed(WORKER_GROUP_PROTOCOL, &codec::encode(&ack)?), ()))
                        }
                    }
                },
            )
            .await;

            match attempt {
                Ok((tunnel, ())) => return Ok(tunnel),
                Err(e @ Error::AuthenticationRejected { .. })
                | Err(e @ Error::ProtocolVersion { .. }) => return Err(e),
                Err(e) => {
                    debug!(peer, interface = %connector.interface, error = %e, "Link attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(Error::PeerUnreachable {
            worker_id: peer,
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no usable connector".to_string()),
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────

pub struct WorkerGroupManager {
    context: Arc<GroupContext>,
    handlers: RwLock<HashMap<String, Arc<dyn ChannelCreatedHandler>>>,
    channels: RwLock<HashMap<ChannelId, Channel>>,
}

impl WorkerGroupManager {
    pub fn new(
        directory: Arc<PeerDirectory>,
        interfaces: Arc<InterfaceRegistry>,
        seed: Arc<GlobalSeed>,
        settings: GroupSettings,
    ) -> Self {
        Self {
            context: Arc::new(GroupContext {
                directory,
                interfaces,
                seed,
                settings,
            }),
            handlers: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Register who sets up channels of `purpose` created by other members
    pub fn on_channel_created(
        &self,
        purpose: &str,
        handler: Arc<dyn ChannelCreatedHandler>,
    ) -> Result<()> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(purpose) {
            return Err(Error::Internal(format!(
                "purpose '{}' already has a channel handler",
                purpose
            )));
        }
        handlers.insert(purpose.to_string(), handler);
        Ok(())
    }

    /// Create a channel over `members`; this worker is always included
    pub fn create_channel(&self, purpose: &str, members: &[WorkerId]) -> Result<Channel> {
        let me = self.context.directory.my_worker_id();
        if me == PROSPECTIVE_WORKER_ID {
            return Err(Error::NotAuthenticated);
        }
        let mut members: Vec<WorkerId> = members.to_vec();
        members.push(me);
        members.sort_unstable();
        members.dedup();
        if let Some(unknown) = members
            .iter()
            .copied()
            .find(|m| *m != me && self.context.directory.get(*m).is_none())
        {
            return Err(Error::PeerNotFound(unknown));
        }

        let descriptor = ChannelDescriptor {
            id: ChannelId::random(),
            purpose: purpose.to_string(),
            members,
        };
        let channel = Channel::new(descriptor, Arc::clone(&self.context));
        self.channels.write().insert(channel.id(), channel.clone());
        info!(
            channel = %channel.id(),
            purpose,
            members = ?channel.members(),
            "Channel created"
        );
        Ok(channel)
    }

    pub fn channel(&self, id: ChannelId) -> Option<Channel> {
        self.channels.read().get(&id).cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.channels.read().values().cloned().collect()
    }

    /// Close a channel's links and forget it locally
    pub fn close_channel(&self, id: ChannelId) -> Result<()> {
        let channel = self
            .channels
            .write()
            .remove(&id)
            .ok_or_else(|| Error::ChannelNotFound(id.to_string()))?;
        channel.close();
        info!(channel = %id, "Channel closed");
        Ok(())
    }

    pub fn close_all(&self) {
        let channels: Vec<Channel> = self.channels.write().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.close();
        }
    }

    fn admit(&self, sync: &GroupSynchronize) -> std::result::Result<(), String> {
        PROTOCOL_VERSION
            .ensure_compatible(&sync.version)
            .map_err(|e| e.to_string())?;

        let my_id = self.context.directory.my_worker_id();
        if my_id == PROSPECTIVE_WORKER_ID || sync.audience != my_id {
            return Err(format!("this is worker {}, not {}", my_id, sync.audience));
        }

        let keys = self
            .context
            .directory
            .link_keys(sync.worker_id)
            .ok_or_else(|| format!("unknown worker {}", sync.worker_id))?;
        if !verify_authenticity_proof(
            &keys.verify,
            &sync.nonce,
            sync.worker_id,
            sync.audience,
            &sync.proof,
        ) {
            return Err("invalid authenticity proof".to_string());
        }

        let members = &sync.channel.members;
        if members.binary_search(&my_id).is_err() || members.binary_search(&sync.worker_id).is_err()
        {
            return Err(format!("not both members of channel {}", sync.channel.id));
        }

        match self.channel(sync.channel.id) {
            Some(known) if known.descriptor() != &sync.channel => {
                Err(format!("channel {} descriptor mismatch", sync.channel.id))
            }
            Some(_) => Ok(()),
            None if self.handlers.read().contains_key(&sync.channel.purpose) => Ok(()),
            None => Err(format!(
                "no channel handler for purpose '{}'",
                sync.channel.purpose
            )),
        }
    }

    fn acknowledge_matches(
        &self,
        sync: &GroupSynchronize,
        response: &[u8],
        acknowledge: &[u8],
    ) -> bool {
        let challenge = match strip_code(WORKER_GROUP_PROTOCOL, response)
            .and_then(|body| codec::decode::<GroupResponse>(body).ok())
        {
            Some(GroupResponse::Accepted { challenge, .. }) => challenge,
            _ => return false,
        };
        let directory = &self.context.directory;
        strip_code(WORKER_GROUP_PROTOCOL, acknowledge)
            .and_then(|body| codec::decode::<GroupAcknowledge>(body).ok())
            .filter(|ack| ack.nonce == sync.nonce)
            .zip(directory.link_keys(sync.worker_id))
            .is_some_and(|(ack, keys)| {
                verify_authenticity_proof(
                    &keys.verify,
                    &challenge,
                    sync.worker_id,
                    directory.my_worker_id(),
                    &ack.proof,
                )
            })
    }

    fn decode_synchronize(payload: &[u8]) -> Option<GroupSynchronize> {
        let body = strip_code(WORKER_GROUP_PROTOCOL, payload)?;
        match codec::decode::<GroupSynchronize>(body) {
            Ok(mut sync) => {
                sync.channel.members.sort_unstable();
                Some(sync)
            }
            Err(e) => {
                debug!(error = %e, "Undecodable group synchronize");
                None
            }
        }
    }

    /// The local channel for `descriptor`, created and announced if new
    async fn adopt(&self, descriptor: &ChannelDescriptor) -> Option<Channel> {
        if let Some(existing) = self.channel(descriptor.id) {
            return Some(existing);
        }
        let handler = self.handlers.read().get(&descriptor.purpose).cloned()?;
        let channel = {
            let mut channels = self.channels.write();
            if let Some(raced) = channels.get(&descriptor.id) {
                return Some(raced.clone());
            }
            let channel = Channel::new(descriptor.clone(), Arc::clone(&self.context));
            channels.insert(channel.id(), channel.clone());
            channel
        };
        info!(
            channel = %channel.id(),
            purpose = %descriptor.purpose,
            members = ?descriptor.members,
            "Joined channel created by another member"
        );
        handler.on_channel_created(channel.clone()).await;
        Some(channel)
    }
}

#[async_trait]
impl ProtocolModule for WorkerGroupManager {
    fn protocol_code(&self) -> u8 {
        WORKER_GROUP_PROTOCOL
    }

    fn name(&self) -> &'static str {
        "worker_group"
    }

    async fn synchronize(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let sync = Self::decode_synchronize(payload)?;
        let response = match self.admit(&sync) {
            Ok(()) => {
                let my_id = self.context.directory.my_worker_id();
                let keys = self.context.directory.link_keys(sync.worker_id)?;
                GroupResponse::Accepted {
                    version: PROTOCOL_VERSION,
                    worker_id: my_id,
                    challenge: new_nonce(),
                    proof: authenticity_proof(&keys.prove, &sync.nonce, my_id, sync.worker_id),
                }
            }
            Err(reason) => {
                warn!(
                    worker_id = sync.worker_id,
                    channel = %sync.channel.id,
                    reason = %reason,
                    "Channel link rejected"
                );
                GroupResponse::Rejected { reason }
            }
        };
        codec::encode(&response)
            .ok()
            .map(|body| framed(WORKER_GROUP_PROTOCOL, &body))
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
        if self.admit(&sync).is_err() {
            tunnel.close();
            return;
        }
        if !self.acknowledge_matches(&sync, &response, &acknowledge) {
            warn!(worker_id = sync.worker_id, "Group acknowledge does not answer our challenge");
            tunnel.close();
            return;
        }

        match self.adopt(&sync.channel).await {
            Some(channel) => {
                channel.attach(sync.worker_id, tunnel);
            }
            None => tunnel.close(),
        }
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
    impl ChannelCreatedHandler for Counting {
        async fn on_channel_created(&self, _channel: Channel) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn secret(id: WorkerId) -> Vec<u8> {
        vec![id as u8; 32]
    }

    fn acceptor(handler: Arc<Counting>) -> WorkerGroupManager {
        let directory = Arc::new(PeerDirectory::new());
        directory.import_my_identity(2, secret(2));
        let one = WorkerPeer {
            worker_id: 1,
            connectors: Vec::new(),
            detail: serde_json::Value::Null,
            authenticity_data: secret(1),
            pairwise_key: Vec::new(),
        };
        directory.import_peers([(1, one)].into()).unwrap();
        let (accepted, _) = mpsc::channel(1);
        let manager = WorkerGroupManager::new(
            directory,
            Arc::new(InterfaceRegistry::new(accepted)),
            Arc::new(GlobalSeed::new()),
            GroupSettings::default(),
        );
        manager.on_channel_created("jobs", handler).unwrap();
        manager
    }

    fn synchronize_from_one(nonce: &str) -> Vec<u8> {
        let sync = GroupSynchronize {
            version: PROTOCOL_VERSION,
            worker_id: 1,
            audience: 2,
            channel: ChannelDescriptor {
                id: ChannelId::random(),
                purpose: "jobs".to_string(),
                members: vec![1, 2],
            },
            nonce: nonce.to_string(),
            proof: authenticity_proof(&secret(1), nonce, 1, 2),
        };
        framed(WORKER_GROUP_PROTOCOL, &codec::encode(&sync).unwrap())
    }

    fn challenge_of(response: &[u8]) -> String {
        let body = strip_code(WORKER_GROUP_PROTOCOL, response).unwrap();
        match codec::decode::<GroupResponse>(body).unwrap() {
            GroupResponse::Accepted { challenge, .. } => challenge,
            other => panic!("link refused: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replayed_link_exchange_rejected() {
        let handler = Arc::new(Counting::default());
        let manager = acceptor(Arc::clone(&handler));
        let sync = synchronize_from_one("n-1");

        let response = manager.synchronize(&sync).await.unwrap();
        let ack = GroupAcknowledge {
            nonce: "n-1".to_string(),
            proof: authenticity_proof(&secret(1), &challenge_of(&response), 1, 2),
        };
        let ack = framed(WORKER_GROUP_PROTOCOL, &codec::encode(&ack).unwrap());
        let (_initiator, tunnel) = memory_pair("mem", None);
        manager
            .acknowledge(sync.clone(), response, ack.clone(), tunnel)
            .await;
        assert_eq!(handler.created.load(Ordering::SeqCst), 1);
        let channel = manager.channels().pop().unwrap();
        assert_eq!(channel.linked_members(), vec![1]);

        for _ in 0..3 {
            let response = manager.synchronize(&sync).await.unwrap();
            let (mut initiator, tunnel) = memory_pair("mem", None);
            manager
                .acknowledge(sync.clone(), response, ack.clone(), tunnel)
                .await;
            assert_eq!(initiator.next_event().await, None);
        }
        assert_eq!(handler.created.load(Ordering::SeqCst), 1);
        assert_eq!(manager.channels().len(), 1);
    }
}
