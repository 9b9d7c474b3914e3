//! Absence Tolerance Record Commission
//!
//! A commission is a fixed set of peers replicating a few named records.
//! Each record is written by one on-duty peer, picked from a seed-derived
//! preference order among the peers believed alive. An update is proposed to
//! every other peer and committed only if enough of the commission
//! acknowledged it within one update interval:
//!
//! ```text
//! on-duty ── propose ──▶ peers      (wait ≤ update_rate)
//!         ── commit ───▶ ackers     if acked * 100 >= total * min_rate
//!         ── abort ────▶ ackers     otherwise (QuorumFailure)
//! ```
//!
//! Peers that stop answering drop out of the duty order until a heartbeat
//! reaches them again. Commissions talk over worker sockets opened with the
//! purpose [`COMMISSION_PURPOSE`].

mod member;
mod record;

pub use member::Commission;
pub use record::{duty_order, quorum_met, CommissionConfig, Record, RecordInit};

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::peer::{PeerDirectory, WorkerId};
use crate::seed::GlobalSeed;
use crate::socket::{WorkerSocket, WorkerSocketHandler, WorkerSocketManager};

pub const COMMISSION_PURPOSE: &str = "absence_tolerance_record_commission";

/// The commissions this worker takes part in
pub struct CommissionManager {
    directory: Arc<PeerDirectory>,
    seed: Arc<GlobalSeed>,
    sockets: Weak<WorkerSocketManager>,
    commissions: RwLock<HashMap<String, Commission>>,
}

impl CommissionManager {
    pub fn new(
        directory: Arc<PeerDirectory>,
        seed: Arc<GlobalSeed>,
        sockets: &Arc<WorkerSocketManager>,
    ) -> Self {
        Self {
            directory,
            seed,
            sockets: Arc::downgrade(sockets),
            commissions: RwLock::new(HashMap::new()),
        }
    }

    /// Start a commission; every commission peer must create it under the same name
    pub fn create(&self, purpose: &str, config: CommissionConfig) -> Result<Commission> {
        let me = self.directory.my_identity().ok_or(Error::NotAuthenticated)?;
        if self.commissions.read().contains_key(purpose) {
            return Err(Error::InvalidCommission {
                purpose: purpose.to_string(),
                message: "already created".to_string(),
            });
        }
        let commission = Commission::start(
            purpose,
            me.worker_id,
            config,
            Arc::clone(&self.seed),
            Weak::clone(&self.sockets),
        )?;
        self.commissions
            .write()
            .insert(purpose.to_string(), commission.clone());
        Ok(commission)
    }

    pub fn get(&self, purpose: &str) -> Option<Commission> {
        self.commissions.read().get(purpose).cloned()
    }

    pub fn remove(&self, purpose: &str) -> Option<Commission> {
        let removed = self.commissions.write().remove(purpose);
        if let Some(commission) = &removed {
            commission.close();
        }
        removed
    }

    pub fn close_all(&self) {
        let all: Vec<Commission> = self.commissions.write().drain().map(|(_, c)| c).collect();
        for commission in all {
            commission.close();
        }
    }

    fn target(&self, parameter: &Value) -> Option<Commission> {
        let purpose = parameter.get("commission")?.as_str()?;
        self.get(purpose)
    }
}

#[async_trait]
impl WorkerSocketHandler for CommissionManager {
    fn authorize(&self, worker_id: WorkerId, parameter: &Value) -> bool {
        self.target(parameter)
            .map(|c| c.is_commission_peer(worker_id))
            .unwrap_or(false)
    }

    async fn on_create(&self, socket: WorkerSocket) {
        let Some(commission) = self.target(socket.parameter()) else {
            socket.close();
            return;
        };
        match commission.serve(&socket) {
            Ok(()) => debug!(
                commission = %commission.purpose(),
                peer = socket.remote_worker_id(),
                "Commission socket accepted"
            ),
            Err(e) => {
                warn!(commission = %commission.purpose(), error = %e, "Commission socket not served");
                socket.close();
            }
        }
    }
}
