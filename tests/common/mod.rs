//! Common test utilities
//!
//! Builds shoals of workers wired together over an in-process memory network.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use shoal_worker::config::WorkerConfig;
use shoal_worker::peer::{ConnectorSetting, WorkerId, WorkerPeer};
use shoal_worker::seed::SEED_LEN;
use shoal_worker::tunnel::{MemoryNetwork, MemoryTransport};
use shoal_worker::Worker;

/// Interface name every test worker registers its memory transport under
pub const MEM: &str = "mem";

pub fn address(worker_id: WorkerId) -> String {
    format!("worker-{}", worker_id)
}

pub fn connect_settings(worker_id: WorkerId) -> Value {
    json!({ "address": address(worker_id) })
}

/// Join token every test member admits with
pub const JOIN_TOKEN: &str = "shoal-test-harbour";

pub fn authenticity_data(worker_id: WorkerId) -> Vec<u8> {
    vec![worker_id as u8; 32]
}

pub fn shared_seed() -> Vec<u8> {
    (0..SEED_LEN).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn peer_entry(worker_id: WorkerId) -> WorkerPeer {
    WorkerPeer {
        worker_id,
        connectors: vec![ConnectorSetting {
            interface: MEM.to_string(),
            settings: connect_settings(worker_id),
        }],
        detail: json!({ "name": address(worker_id) }),
        authenticity_data: authenticity_data(worker_id),
        pairwise_key: Vec::new(),
    }
}

/// A set of workers that all know each other and share one seed
pub struct Shoal {
    pub network: Arc<MemoryNetwork>,
    pub workers: BTreeMap<WorkerId, Worker>,
}

impl Shoal {
    /// Start workers `ids`, each listening on `worker-<id>`
    pub async fn start(ids: &[WorkerId]) -> Self {
        Self::start_with(ids, WorkerConfig::default()).await
    }

    pub async fn start_with(ids: &[WorkerId], config: WorkerConfig) -> Self {
        let network = MemoryNetwork::new();
        let mut workers = BTreeMap::new();
        for &id in ids {
            let worker = Worker::new(&config).unwrap();
            worker.import_my_worker_authenticity_data(id, authenticity_data(id));
            worker.import_join_token(Some(JOIN_TOKEN.to_string()));
            worker
                .import_static_global_random_seed(&shared_seed())
                .unwrap();
            let peers: BTreeMap<WorkerId, WorkerPeer> = ids
                .iter()
                .filter(|&&other| other != id)
                .map(|&other| (other, peer_entry(other)))
                .collect();
            worker.import_worker_peers_settings(peers).unwrap();
            listen(&worker, &network, &address(id)).await;
            workers.insert(id, worker);
        }
        Self { network, workers }
    }

    pub fn worker(&self, id: WorkerId) -> &Worker {
        &self.workers[&id]
    }

    /// Make a worker unreachable: stop its listener and close what it holds
    pub fn stop(&self, id: WorkerId) {
        self.network.unlisten(&address(id));
        self.worker(id).shutdown();
    }
}

/// A worker with no identity that can only join, holding the shoal's join token
pub async fn prospective(network: &Arc<MemoryNetwork>, listen_on: &str) -> Worker {
    prospective_with_token(network, listen_on, Some(JOIN_TOKEN)).await
}

pub async fn prospective_with_token(
    network: &Arc<MemoryNetwork>,
    listen_on: &str,
    token: Option<&str>,
) -> Worker {
    let worker = Worker::new(&WorkerConfig::default()).unwrap();
    worker
        .import_static_global_random_seed(&shared_seed())
        .unwrap();
    worker.import_join_token(token.map(str::to_string));
    listen(&worker, network, listen_on).await;
    worker
}

pub async fn listen(worker: &Worker, network: &Arc<MemoryNetwork>, addr: &str) {
    worker
        .create_interface(
            MEM,
            Arc::new(MemoryTransport::new(Arc::clone(network))),
            Some(&json!({ "address": addr })),
        )
        .await
        .unwrap();
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
