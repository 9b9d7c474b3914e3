//! One commission as seen by one of its peers

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::peer::WorkerId;
use crate::seed::GlobalSeed;
use crate::socket::{CallResponder, WorkerSocket, WorkerSocketManager};

use super::record::{duty_order, quorum_met, CommissionConfig, Record};
use super::COMMISSION_PURPOSE;

/// A peer that missed the latest heartbeat is absent at once. Otherwise it
/// stays alive this many update intervals after its last answer, so the gap
/// between two heartbeat answers never exceeds the window.
const LIVENESS_INTERVALS: u32 = 2;

pub(crate) const FN_PROPOSE: &str = "commission.propose";
pub(crate) const FN_COMMIT: &str = "commission.commit";
pub(crate) const FN_ABORT: &str = "commission.abort";
pub(crate) const FN_FORWARD: &str = "commission.forward";
pub(crate) const FN_HEARTBEAT: &str = "commission.heartbeat";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Proposal {
    record: Record,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Settle {
    key: String,
    update_iterations: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ForwardedUpdate {
    key: String,
    value: Value,
}

/// What the on-duty peer answers a forwarded update with
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ForwardOutcome {
    Committed {
        record: Record,
    },
    QuorumFailure {
        acknowledged: usize,
        total: usize,
        required_percent: u8,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Heartbeat {
    records: Vec<Record>,
}

struct CommissionState {
    records: BTreeMap<String, Record>,
    /// Proposed but not yet committed, by key
    pending: HashMap<String, Record>,
    last_seen: HashMap<WorkerId, Instant>,
    sockets: HashMap<WorkerId, WorkerSocket>,
}

pub(crate) struct CommissionInner {
    purpose: String,
    me: WorkerId,
    config: CommissionConfig,
    seed: Arc<GlobalSeed>,
    sockets: Weak<WorkerSocketManager>,
    state: Mutex<CommissionState>,
    /// Serializes updates this peer runs as on-duty
    update_gate: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
}

/// Handle to a running commission; clones share it
#[derive(Clone)]
pub struct Commission {
    pub(crate) inner: Arc<CommissionInner>,
}

impl std::fmt::Debug for Commission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Commission")
            .field("purpose", &self.inner.purpose)
            .field("me", &self.inner.me)
            .finish()
    }
}

impl Commission {
    pub(crate) fn start(
        purpose: &str,
        me: WorkerId,
        config: CommissionConfig,
        seed: Arc<GlobalSeed>,
        sockets: Weak<WorkerSocketManager>,
    ) -> Result<Self> {
        let config = config.normalize(purpose, me)?;
        // Fails early when no seed was imported
        seed.stream(purpose)?;

        let now = Instant::now();
        let records = config
            .records
            .iter()
            .map(|(key, init)| {
                (
                    key.clone(),
                    Record {
                        key: key.clone(),
                        value: init.value.clone(),
                        update_iterations: init.update_iterations,
                        on_duty: me,
                    },
                )
            })
            .collect();
        let last_seen = config
            .commission_peers
            .iter()
            .filter(|p| **p != me)
            .map(|p| (*p, now))
            .collect();

        let (shutdown, _) = watch::channel(false);
        let commission = Self {
            inner: Arc::new(CommissionInner {
                purpose: purpose.to_string(),
                me,
                config,
                seed,
                sockets,
                state: Mutex::new(CommissionState {
                    records,
                    pending: HashMap::new(),
                    last_seen,
                    sockets: HashMap::new(),
                }),
                update_gate: tokio::sync::Mutex::new(()),
                shutdown,
            }),
        };

        tokio::spawn(heartbeat_loop(
            Arc::downgrade(&commission.inner),
            commission.inner.shutdown.subscribe(),
            commission.inner.config.update_rate,
        ));
        info!(
            commission = %purpose,
            peers = ?commission.inner.config.commission_peers,
            records = commission.inner.config.records.len(),
            "Commission started"
        );
        Ok(commission)
    }

    pub fn purpose(&self) -> &str {
        &self.inner.purpose
    }

    pub fn config(&self) -> &CommissionConfig {
        &self.inner.config
    }

    pub fn get(&self, key: &str) -> Option<Record> {
        self.inner.state.lock().records.get(key).cloned()
    }

    pub fn records(&self) -> Vec<Record> {
        self.inner.state.lock().records.values().cloned().collect()
    }

    pub fn is_commission_peer(&self, worker_id: WorkerId) -> bool {
        self.inner
            .config
            .commission_peers
            .binary_search(&worker_id)
            .is_ok()
    }

    /// Commission peers believed alive, this one included
    pub fn alive_peers(&self) -> Vec<WorkerId> {
        let window = self.inner.config.update_rate * LIVENESS_INTERVALS;
        let state = self.inner.state.lock();
        self.inner
            .config
            .commission_peers
            .iter()
            .copied()
            .filter(|p| {
                *p == self.inner.me
                    || state
                        .last_seen
                        .get(p)
                        .map(|seen| seen.elapsed() <= window)
                        .unwrap_or(false)
            })
            .collect()
    }

    /// The peer currently on duty for `key`
    pub fn on_duty(&self, key: &str) -> Result<WorkerId> {
        let alive = self.alive_peers();
        let order = duty_order(
            &self.inner.seed,
            &self.inner.purpose,
            key,
            &self.inner.config.commission_peers,
        )?;
        Ok(order
            .into_iter()
            .find(|p| alive.contains(p))
            .unwrap_or(self.inner.me))
    }

    /// Stop the heartbeat and close this commission's sockets
    pub fn close(&self) {
        self.inner.shutdown.send_replace(true);
        let sockets: Vec<WorkerSocket> = self
            .inner
            .state
            .lock()
            .sockets
            .drain()
            .map(|(_, s)| s)
            .collect();
        for socket in sockets {
            socket.close();
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Updates
    // ─────────────────────────────────────────────────────────────

    /// Commit a new value for `key` through its on-duty peer.
    ///
    /// Succeeds once enough of the commission acknowledged the proposal within
    /// one update interval; otherwise fails with [`Error::QuorumFailure`] and
    /// every replica keeps its previous value.
    pub async fn update_record_value(&self, key: &str, value: Value) -> Result<Record> {
        if self.get(key).is_none() {
            return Err(Error::RecordNotFound(key.to_string()));
        }

        let order = duty_order(
            &self.inner.seed,
            &self.inner.purpose,
            key,
            &self.inner.config.commission_peers,
        )?;
        for candidate in order {
            if candidate == self.inner.me {
                return self.run_update(key, value).await;
            }
            if !self.alive_peers().contains(&candidate) {
                continue;
            }
            let request = ForwardedUpdate {
                key: key.to_string(),
                value: value.clone(),
            };
            match self.call_peer(candidate, FN_FORWARD, serde_json::to_value(&request)?).await {
                Ok(answer) => {
                    return match serde_json::from_value::<ForwardOutcome>(answer)? {
                        ForwardOutcome::Committed { record } => {
                            self.store_if_newer(record.clone());
                            Ok(record)
                        }
                        ForwardOutcome::QuorumFailure {
                            acknowledged,
                            total,
                            required_percent,
                        } => Err(Error::QuorumFailure {
                            key: key.to_string(),
                            acknowledged,
                            total,
                            required_percent,
                        }),
                    };
                }
                // The on-duty peer is there but refused; taking over would race it
                Err(e @ Error::CallError { .. }) => return Err(e),
                Err(e) => {
                    warn!(
                        commission = %self.inner.purpose,
                        key,
                        on_duty = candidate,
                        error = %e,
                        "On-duty peer unreachable, taking over"
                    );
                    self.mark_absent(candidate);
                }
            }
        }
        self.run_update(key, value).await
    }

    /// Propose to every other peer, then commit or abort
    async fn run_update(&self, key: &str, value: Value) -> Result<Record> {
        let _gate = self.inner.update_gate.lock().await;
        let current = self
            .get(key)
            .ok_or_else(|| Error::RecordNotFound(key.to_string()))?;
        let record = Record {
            key: key.to_string(),
            value,
            update_iterations: current.update_iterations + 1,
            on_duty: self.inner.me,
        };

        let proposal = serde_json::to_value(Proposal {
            record: record.clone(),
        })?;
        let others = self.other_peers();
        let answers = join_all(others.iter().map(|&peer| {
            let proposal = proposal.clone();
            async move {
                let answer = timeout(
                    self.inner.config.update_rate,
                    self.call_peer(peer, FN_PROPOSE, proposal),
                )
                .await;
                (peer, matches!(answer, Ok(Ok(_))))
            }
        }))
        .await;

        let acked: Vec<WorkerId> = answers
            .into_iter()
            .filter_map(|(peer, ok)| {
                if ok {
                    self.mark_seen(peer);
                    Some(peer)
                } else {
                    self.mark_absent(peer);
                    None
                }
            })
            .collect();

        let total = self.inner.config.commission_peers.len();
        let acknowledged = acked.len() + 1;
        let required = self.inner.config.min_successful_update_rate;
        let settle = serde_json::to_value(Settle {
            key: key.to_string(),
            update_iterations: record.update_iterations,
        })?;

        if !quorum_met(acknowledged, total, required) {
            self.settle_all(&acked, FN_ABORT, &settle).await;
            warn!(
                commission = %self.inner.purpose,
                key,
                acknowledged,
                total,
                required_percent = required,
                "Record update failed quorum"
            );
            return Err(Error::QuorumFailure {
                key: key.to_string(),
                acknowledged,
                total,
                required_percent: required,
            });
        }

        self.store_if_newer(record.clone());
        self.settle_all(&acked, FN_COMMIT, &settle).await;
        info!(
            commission = %self.inner.purpose,
            key,
            update_iterations = record.update_iterations,
            acknowledged,
            total,
            "Record update committed"
        );
        Ok(record)
    }

    async fn settle_all(&self, peers: &[WorkerId], function: &str, settle: &Value) {
        join_all(peers.iter().map(|&peer| async move {
            if let Err(e) = self.call_peer(peer, function, settle.clone()).await {
                debug!(commission = %self.inner.purpose, peer, function, error = %e, "Settle not delivered");
            }
        }))
        .await;
    }

    // ─────────────────────────────────────────────────────────────
    // Replica Side
    // ─────────────────────────────────────────────────────────────

    /// Install the commission functions on a socket opened by a peer
    pub(crate) fn serve(&self, socket: &WorkerSocket) -> Result<()> {
        let peer = socket.remote_worker_id();
        self.define(socket, FN_PROPOSE, move |c, param| async move {
            let proposal: Proposal = serde_json::from_value(param)?;
            c.mark_seen(peer);
            c.inner
                .state
                .lock()
                .pending
                .insert(proposal.record.key.clone(), proposal.record);
            Ok(Value::Null)
        })?;
        self.define(socket, FN_COMMIT, move |c, param| async move {
            let settle: Settle = serde_json::from_value(param)?;
            c.mark_seen(peer);
            let pending = {
                let mut state = c.inner.state.lock();
                match state.pending.get(&settle.key) {
                    Some(r) if r.update_iterations == settle.update_iterations => {
                        state.pending.remove(&settle.key)
                    }
                    _ => None,
                }
            };
            if let Some(record) = pending {
                debug!(commission = %c.inner.purpose, key = %record.key, update_iterations = record.update_iterations, "Replica committed");
                c.store_if_newer(record);
            }
            Ok(Value::Null)
        })?;
        self.define(socket, FN_ABORT, move |c, param| async move {
            let settle: Settle = serde_json::from_value(param)?;
            let mut state = c.inner.state.lock();
            if state
                .pending
                .get(&settle.key)
                .map(|r| r.update_iterations == settle.update_iterations)
                .unwrap_or(false)
            {
                state.pending.remove(&settle.key);
            }
            Ok(Value::Null)
        })?;
        self.define(socket, FN_FORWARD, move |c, param| async move {
            let update: ForwardedUpdate = serde_json::from_value(param)?;
            c.mark_seen(peer);
            let outcome = match c.run_update(&update.key, update.value).await {
                Ok(record) => ForwardOutcome::Committed { record },
                Err(Error::QuorumFailure {
                    acknowledged,
                    total,
                    required_percent,
                    ..
                }) => ForwardOutcome::QuorumFailure {
                    acknowledged,
                    total,
                    required_percent,
                },
                Err(e) => return Err(e),
            };
            Ok(serde_json::to_value(outcome)?)
        })?;
        self.define(socket, FN_HEARTBEAT, move |c, param| async move {
            let beat: Heartbeat = serde_json::from_value(param)?;
            c.mark_seen(peer);
            for record in beat.records {
                c.store_if_newer(record);
            }
            Ok(json!({ "worker_id": c.inner.me }))
        })?;
        Ok(())
    }

    fn define<F, Fut>(&self, socket: &WorkerSocket, function: &str, handler: F) -> Result<()>
    where
        F: Fn(Commission, Value) -> Fut + Send + Sync + Copy + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        socket.define(function, move |param: Value, responder: CallResponder| {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade().filter(|i| !*i.shutdown.borrow()) else {
                    let _ = responder.return_error("commission closed");
                    return;
                };
                let sent = match handler(Commission { inner }, param).await {
                    Ok(answer) => responder.return_data(answer),
                    Err(e) => responder.return_error(e.to_string()),
                };
                if let Err(e) = sent {
                    debug!(error = %e, "Commission answer not sent");
                }
            }
        })
    }

    fn store_if_newer(&self, record: Record) {
        let mut state = self.inner.state.lock();
        match state.records.get(&record.key) {
            Some(current) if !record.supersedes(current) => {}
            _ => {
                state.records.insert(record.key.clone(), record);
            }
        }
    }

    fn mark_seen(&self, peer: WorkerId) {
        self.inner.state.lock().last_seen.insert(peer, Instant::now());
    }

    fn mark_absent(&self, peer: WorkerId) {
        self.inner.state.lock().last_seen.remove(&peer);
    }

    fn other_peers(&self) -> Vec<WorkerId> {
        self.inner
            .config
            .commission_peers
            .iter()
            .copied()
            .filter(|p| *p != self.inner.me)
            .collect()
    }

    // ─────────────────────────────────────────────────────────────
    // Sockets
    // ─────────────────────────────────────────────────────────────

    async fn socket_to(&self, peer: WorkerId) -> Result<WorkerSocket> {
        let cached = self.inner.state.lock().sockets.get(&peer).cloned();
        if let Some(socket) = cached {
            if !socket.is_closed() {
                return Ok(socket);
            }
        }
        let manager = self
            .inner
            .sockets
            .upgrade()
            .ok_or_else(|| Error::Internal("worker socket manager is gone".to_string()))?;
        let socket = manager
            .open(
                peer,
                COMMISSION_PURPOSE,
                json!({ "commission": self.inner.purpose }),
            )
            .await?;
        self.inner.state.lock().sockets.insert(peer, socket.clone());
        Ok(socket)
    }

    async fn call_peer(&self, peer: WorkerId, function: &str, parameter: Value) -> Result<Value> {
        let socket = self.socket_to(peer).await?;
        socket.call_once(function, parameter).await
    }

    /// Push the records this peer is on duty for and refresh liveness
    async fn heartbeat(&self) {
        let mine: Vec<Record> = self
            .records()
            .into_iter()
            .filter(|r| self.on_duty(&r.key).map(|p| p == self.inner.me).unwrap_or(false))
            .collect();
        let beat = match serde_json::to_value(Heartbeat { records: mine }) {
            Ok(beat) => beat,
            Err(e) => {
                warn!(error = %e, "Heartbeat not encodable");
                return;
            }
        };
        let rate = self.inner.config.update_rate;
        let others = self.other_peers();
        let results = join_all(others.iter().map(|&peer| {
            let beat = beat.clone();
            async move {
                let answer = timeout(rate, self.call_peer(peer, FN_HEARTBEAT, beat)).await;
                (peer, matches!(answer, Ok(Ok(_))))
            }
        }))
        .await;
        for (peer, ok) in results {
            if ok {
                self.mark_seen(peer);
            } else {
                self.mark_absent(peer);
            }
        }
    }
}

async fn heartbeat_loop(
    commission: Weak<CommissionInner>,
    mut shutdown: watch::Receiver<bool>,
    rate: Duration,
) {
    let mut ticker = tokio::time::interval(rate);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let Some(inner) = commission.upgrade() else {
            break;
        };
        Commission { inner }.heartbeat().await;
    }
}
