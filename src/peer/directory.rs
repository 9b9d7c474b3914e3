//! Worker peer directory: known workers and their connector settings
//!
//! Populated by `import_worker_peers_settings` and mutated by the membership
//! operations (join / update / leave). Read-only everywhere else.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::codec::hex_bytes;
use crate::error::{Error, Result};

use super::{WorkerId, PROSPECTIVE_WORKER_ID};

// ─────────────────────────────────────────────────────────────────
// Peer Info
// ─────────────────────────────────────────────────────────────────

/// One way of reaching a worker: an interface name plus its connect parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorSetting {
    /// Name of the local interface (transport) to connect through
    pub interface: String,

    /// Transport-specific connect parameters
    #[serde(default)]
    pub settings: Value,
}

/// Information about a known worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPeer {
    /// Worker id (never 0 inside the directory)
    pub worker_id: WorkerId,

    /// Connectors tried in order when opening a tunnel to this worker
    #[serde(default)]
    pub connectors: Vec<ConnectorSetting>,

    /// Opaque application metadata
    #[serde(default)]
    pub detail: Value,

    /// Secret used to prove this worker's identity
    #[serde(with = "hex_bytes", default)]
    pub authenticity_data: Vec<u8>,

    /// Key shared with this worker only; set for links involving a joined worker
    #[serde(with = "hex_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub pairwise_key: Vec<u8>,
}

impl WorkerPeer {
    /// The same entry without any key material
    pub fn without_secrets(mut self) -> Self {
        self.authenticity_data.clear();
        self.pairwise_key.clear();
        self
    }
}

/// Identity of the local worker
#[derive(Debug, Clone, PartialEq)]
pub struct MyIdentity {
    pub worker_id: WorkerId,
    pub authenticity_data: Vec<u8>,
}

/// Keys for handshakes with one peer
#[derive(Debug, Clone, PartialEq)]
pub struct LinkKeys {
    /// Keys this worker's proofs
    pub prove: Vec<u8>,
    /// Checks the peer's proofs
    pub verify: Vec<u8>,
}

/// Membership change notification
#[derive(Debug, Clone, PartialEq)]
pub enum PeerChange {
    Joined(WorkerId),
    Updated(WorkerId),
    Left(WorkerId),
}

// ─────────────────────────────────────────────────────────────────
// Peer Directory
// ─────────────────────────────────────────────────────────────────

/// Thread-safe directory of known workers
pub struct PeerDirectory {
    me: RwLock<Option<MyIdentity>>,
    peers: RwLock<HashMap<WorkerId, WorkerPeer>>,
    changes: broadcast::Sender<PeerChange>,
}

impl PeerDirectory {
    /// Create a new empty directory
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            me: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Set the local worker's identity
    pub fn import_my_identity(&self, worker_id: WorkerId, authenticity_data: Vec<u8>) {
        info!(worker_id, "Imported worker authenticity data");
        *self.me.write() = Some(MyIdentity {
            worker_id,
            authenticity_data,
        });
    }

    /// Drop the local identity; the worker is prospective again
    pub fn forget_my_identity(&self) {
        if let Some(me) = self.me.write().take() {
            info!(worker_id = me.worker_id, "Forgot worker identity");
        }
    }

    /// The local identity, if imported
    pub fn my_identity(&self) -> Option<MyIdentity> {
        self.me.read().clone()
    }

    /// The local worker id; `0` until an identity is imported
    pub fn my_worker_id(&self) -> WorkerId {
        self.me
            .read()
            .as_ref()
            .map(|me| me.worker_id)
            .unwrap_or(PROSPECTIVE_WORKER_ID)
    }

    /// Replace the whole peer set, emitting the resulting changes
    pub fn import_peers(&self, peers: BTreeMap<WorkerId, WorkerPeer>) -> Result<()> {
        if peers.contains_key(&PROSPECTIVE_WORKER_ID) {
            return Err(Error::config_field_invalid(
                "peers",
                "worker id 0 is reserved for prospective joiners",
            ));
        }

        let mut changes = Vec::new();
        {
            let mut current = self.peers.write();
            for id in current.keys() {
                if !peers.contains_key(id) {
                    changes.push(PeerChange::Left(*id));
                }
            }
            for (id, peer) in &peers {
                match current.get(id) {
                    None => changes.push(PeerChange::Joined(*id)),
                    Some(existing) if existing != peer => changes.push(PeerChange::Updated(*id)),
                    Some(_) => {}
                }
            }
            *current = peers
                .into_iter()
                .map(|(id, mut peer)| {
                    peer.worker_id = id;
                    (id, peer)
                })
                .collect();
        }

        info!(peer_count = self.peer_count(), "Imported worker peer settings");
        for change in changes {
            self.emit(change);
        }
        Ok(())
    }

    /// Register a newly joined worker
    pub fn join(&self, peer: WorkerPeer) -> Result<()> {
        if peer.worker_id == PROSPECTIVE_WORKER_ID {
            return Err(Error::Internal("cannot register worker id 0".to_string()));
        }
        let id = peer.worker_id;
        let replaced = self.peers.write().insert(id, peer).is_some();
        self.emit(if replaced {
            PeerChange::Updated(id)
        } else {
            PeerChange::Joined(id)
        });
        Ok(())
    }

    /// Update a worker's connectors and detail
    pub fn update(
        &self,
        worker_id: WorkerId,
        connectors: Vec<ConnectorSetting>,
        detail: Value,
    ) -> Result<()> {
        {
            let mut peers = self.peers.write();
            let peer = peers
                .get_mut(&worker_id)
                .ok_or(Error::PeerNotFound(worker_id))?;
            peer.connectors = connectors;
            peer.detail = detail;
        }
        self.emit(PeerChange::Updated(worker_id));
        Ok(())
    }

    /// Remove a worker
    pub fn leave(&self, worker_id: WorkerId) -> Option<WorkerPeer> {
        let removed = self.peers.write().remove(&worker_id);
        if removed.is_some() {
            self.emit(PeerChange::Left(worker_id));
        }
        removed
    }

    /// Drop every peer (used when the local worker leaves)
    pub fn clear(&self) {
        let ids: Vec<WorkerId> = self.peers.write().drain().map(|(id, _)| id).collect();
        for id in ids {
            self.emit(PeerChange::Left(id));
        }
    }

    /// Get a clone of a peer's info
    pub fn get(&self, worker_id: WorkerId) -> Option<WorkerPeer> {
        self.peers.read().get(&worker_id).cloned()
    }

    /// Keys for a handshake with `peer`.
    ///
    /// A pairwise key, when the entry has one, serves both directions.
    /// Otherwise this worker proves with its own authenticity data and checks
    /// the peer against the peer's. `None` without an identity, for unknown
    /// peers, or when there is nothing to check the peer against.
    pub fn link_keys(&self, peer: WorkerId) -> Option<LinkKeys> {
        let me = self.my_identity()?;
        let entry = self.get(peer)?;
        let keys = if entry.pairwise_key.is_empty() {
            LinkKeys {
                prove: me.authenticity_data,
                verify: entry.authenticity_data,
            }
        } else {
            LinkKeys {
                prove: entry.pairwise_key.clone(),
                verify: entry.pairwise_key,
            }
        };
        (!keys.prove.is_empty() && !keys.verify.is_empty()).then_some(keys)
    }

    /// Get all known peers, ordered by worker id
    pub fn all_peers(&self) -> BTreeMap<WorkerId, WorkerPeer> {
        self.peers
            .read()
            .iter()
            .map(|(id, peer)| (*id, peer.clone()))
            .collect()
    }

    /// Known worker ids in ascending order
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.peers.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Get count of known peers
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Lowest id above every id in use, counting the local worker
    pub fn next_free_worker_id(&self) -> WorkerId {
        let highest_peer = self.peers.read().keys().copied().max().unwrap_or(0);
        highest_peer.max(self.my_worker_id()) + 1
    }

    /// Subscribe to membership changes
    pub fn subscribe(&self) -> broadcast::Receiver<PeerChange> {
        self.changes.subscribe()
    }

    fn emit(&self, change: PeerChange) {
        debug!(change = ?change, "Peer directory changed");
        // No subscribers is fine
        let _ = self.changes.send(change);
    }
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
