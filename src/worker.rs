//! The worker: one process-wide bundle of directory, seed, interfaces and
//! protocol managers
//!
//! ```text
//! listeners ─▶ accepted tunnels ─▶ HandshakeCoordinator
//!                                   ├─ 0x01 WorkerSocketManager ─▶ membership, commissions, apps
//!                                   └─ 0x02 WorkerGroupManager  ─▶ channels
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::commission::{CommissionManager, COMMISSION_PURPOSE};
use crate::config::{InterfaceSettings, WorkerConfig};
use crate::error::{Error, Result};
use crate::group::{GroupOutcome, WorkerGroupManager};
use crate::membership::{Membership, MembershipHandler, Profile};
use crate::peer::{ConnectorSetting, PeerDirectory, WorkerId, WorkerPeer};
use crate::protocol::{HandshakeCoordinator, ProtocolRegistry};
use crate::seed::GlobalSeed;
use crate::socket::{WorkerSocketManager, MEMBERSHIP_PURPOSE};
use crate::tunnel::{InterfaceId, InterfaceRegistry, TcpTransport, Transport};

/// Depth of the queue between listeners and the handshake coordinator
const ACCEPT_QUEUE: usize = 256;

pub struct Worker {
    directory: Arc<PeerDirectory>,
    seed: Arc<GlobalSeed>,
    interfaces: Arc<InterfaceRegistry>,
    sockets: Arc<WorkerSocketManager>,
    groups: Arc<WorkerGroupManager>,
    commissions: Arc<CommissionManager>,
    membership: Arc<Membership>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Wire up the managers and start accepting handshakes.
    ///
    /// The worker has no identity, peers, seed or interfaces yet; import them
    /// or use [`from_config`](Self::from_config).
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let directory = Arc::new(PeerDirectory::new());
        let seed = Arc::new(GlobalSeed::new());
        let (accepted_tx, accepted_rx) = mpsc::channel(ACCEPT_QUEUE);
        let interfaces = Arc::new(InterfaceRegistry::new(accepted_tx));

        let sockets = Arc::new(WorkerSocketManager::new(
            Arc::clone(&directory),
            Arc::clone(&interfaces),
            config.worker_socket.clone(),
        ));
        let groups = Arc::new(WorkerGroupManager::new(
            Arc::clone(&directory),
            Arc::clone(&interfaces),
            Arc::clone(&seed),
            config.group.clone(),
        ));
        let commissions = Arc::new(CommissionManager::new(
            Arc::clone(&directory),
            Arc::clone(&seed),
            &sockets,
        ));
        let membership = Arc::new(Membership::new(Arc::clone(&directory), &sockets));

        sockets.on_purpose(
            MEMBERSHIP_PURPOSE,
            Arc::new(MembershipHandler::new(&membership)),
        )?;
        sockets.on_purpose(COMMISSION_PURPOSE, Arc::clone(&commissions) as _)?;

        let registry = ProtocolRegistry::builder()
            .register(Arc::clone(&sockets) as _)?
            .register(Arc::clone(&groups) as _)?
            .build();
        let coordinator = Arc::new(HandshakeCoordinator::new(
            Arc::new(registry),
            Arc::clone(&seed),
        ));
        let handle = tokio::spawn(coordinator.run(accepted_rx));

        Ok(Self {
            directory,
            seed,
            interfaces,
            sockets,
            groups,
            commissions,
            membership,
            coordinator: Mutex::new(Some(handle)),
        })
    }

    /// Build a worker and apply every section of the configuration
    pub async fn from_config(config: &WorkerConfig) -> Result<Self> {
        let worker = Self::new(config)?;

        if let Some(path) = &config.worker.seed_file {
            worker.seed.import_file(Path::new(path))?;
        }
        if let Some(data) = config.authenticity_data()? {
            if config.worker.id != 0 {
                worker.import_my_worker_authenticity_data(config.worker.id, data);
            }
        }
        worker.import_worker_peers_settings(config.peer_map()?)?;
        worker.import_join_token(config.worker.join_token.clone());
        worker.membership.set_profile(Profile {
            connectors: config.worker.connectors.clone(),
            detail: config.worker.detail.clone(),
        });

        for interface in &config.interfaces {
            let transport = configured_transport(interface)?;
            worker
                .create_interface(&interface.name, transport, interface.settings.as_ref())
                .await?;
        }

        info!(
            worker_id = worker.my_worker_id(),
            peers = config.peers.len(),
            interfaces = config.interfaces.len(),
            "Worker configured"
        );
        Ok(worker)
    }

    // ─────────────────────────────────────────────────────────────
    // Imports
    // ─────────────────────────────────────────────────────────────

    pub fn import_my_worker_authenticity_data(&self, worker_id: WorkerId, data: Vec<u8>) {
        self.directory.import_my_identity(worker_id, data);
    }

    pub fn import_worker_peers_settings(&self, peers: BTreeMap<WorkerId, WorkerPeer>) -> Result<()> {
        self.directory.import_peers(peers)
    }

    /// Token required from joiners, and presented when this worker joins
    pub fn import_join_token(&self, token: Option<String>) {
        self.membership.set_join_token(token);
    }

    pub fn import_static_global_random_seed(&self, bytes: &[u8]) -> Result<()> {
        self.seed.import(bytes)
    }

    /// Register an interface; with `listen_settings` it also accepts tunnels
    pub async fn create_interface(
        &self,
        name: &str,
        transport: Arc<dyn Transport>,
        listen_settings: Option<&Value>,
    ) -> Result<InterfaceId> {
        self.interfaces
            .create_interface(name, transport, listen_settings)
            .await
    }

    // ─────────────────────────────────────────────────────────────
    // Membership
    // ─────────────────────────────────────────────────────────────

    /// Join a shoal through one of its members; returns the assigned id
    pub async fn join_me(
        &self,
        interface: &str,
        connect_settings: &Value,
        connectors: Vec<ConnectorSetting>,
        detail: Value,
    ) -> Result<WorkerId> {
        self.membership
            .join(interface, connect_settings, Profile { connectors, detail })
            .await
    }

    pub async fn update_me(
        &self,
        connectors: Vec<ConnectorSetting>,
        detail: Value,
    ) -> Result<GroupOutcome> {
        self.membership
            .update(Profile { connectors, detail })
            .await
    }

    pub async fn leave_me(&self) -> Result<GroupOutcome> {
        let outcome = self.membership.leave().await?;
        self.commissions.close_all();
        self.groups.close_all();
        self.sockets.close_all();
        Ok(outcome)
    }

    // ─────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────

    pub fn my_worker_id(&self) -> WorkerId {
        self.directory.my_worker_id()
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn seed(&self) -> &Arc<GlobalSeed> {
        &self.seed
    }

    pub fn interfaces(&self) -> &Arc<InterfaceRegistry> {
        &self.interfaces
    }

    pub fn sockets(&self) -> &Arc<WorkerSocketManager> {
        &self.sockets
    }

    pub fn groups(&self) -> &Arc<WorkerGroupManager> {
        &self.groups
    }

    pub fn commissions(&self) -> &Arc<CommissionManager> {
        &self.commissions
    }

    /// Stop accepting handshakes and close everything this worker holds open
    pub fn shutdown(&self) {
        if let Some(handle) = self.coordinator.lock().take() {
            handle.abort();
        }
        self.commissions.close_all();
        self.groups.close_all();
        self.sockets.close_all();
        info!(worker_id = self.my_worker_id(), "Worker shut down");
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(handle) = self.coordinator.lock().take() {
            handle.abort();
        }
    }
}

fn configured_transport(interface: &InterfaceSettings) -> Result<Arc<dyn Transport>> {
    match interface.transport.as_str() {
        "tcp" => Ok(Arc::new(TcpTransport::new(Duration::from_millis(
            interface.connect_timeout_ms,
        )))),
        other => Err(Error::config_field_invalid(
            "interfaces.transport",
            format!(
                "transport '{}' of interface '{}' cannot be configured from a file",
                other, interface.name
            ),
        )),
    }
}
