//! Membership: join, update and leave a shoal
//!
//! Runs over worker sockets opened with [`MEMBERSHIP_PURPOSE`]. That purpose
//! is the only one a prospective worker (id 0) may open, and only to ask for
//! admission. The socket parameter carries the join token; a member admits
//! nobody unless it has one configured and the tokens match.
//!
//! ```text
//! joiner (id 0) ── membership.join { connectors, detail } ──▶ member
//!               ◀── { worker_id, authenticity_data, peers } ──
//! member        ── membership.joined { peer, pairwise_key } ──▶ each other member
//! ```
//!
//! `peers` carries no key material. The joiner derives one pairwise key per
//! member from its own authenticity data, and each member is told only the
//! key it shares with the joiner.
//!
//! `update` and `leave` are sent by the member itself to every peer it knows.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::codec::hex_bytes;
use crate::error::{Error, Result};
use crate::group::GroupOutcome;
use crate::peer::{
    derive_pairwise_key, generate_authenticity_data, join_token_matches, ConnectorSetting,
    PeerDirectory, WorkerId, WorkerPeer, PROSPECTIVE_WORKER_ID,
};
use crate::socket::{
    CallResponder, WorkerSocket, WorkerSocketHandler, WorkerSocketManager, MEMBERSHIP_PURPOSE,
};

const FN_JOIN: &str = "membership.join";
const FN_JOINED: &str = "membership.joined";
const FN_UPDATE: &str = "membership.update";
const FN_LEAVE: &str = "membership.leave";

/// How this worker presents itself to the others
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub connectors: Vec<ConnectorSetting>,
    #[serde(default)]
    pub detail: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Admission {
    worker_id: WorkerId,
    #[serde(with = "hex_bytes")]
    authenticity_data: Vec<u8>,
    peers: BTreeMap<WorkerId, WorkerPeer>,
}

pub struct Membership {
    directory: Arc<PeerDirectory>,
    sockets: Weak<WorkerSocketManager>,
    profile: RwLock<Profile>,
    join_token: RwLock<Option<String>>,
}

impl Membership {
    pub fn new(directory: Arc<PeerDirectory>, sockets: &Arc<WorkerSocketManager>) -> Self {
        Self {
            directory,
            sockets: Arc::downgrade(sockets),
            profile: RwLock::new(Profile::default()),
            join_token: RwLock::new(None),
        }
    }

    /// Token presented when joining, and required from joiners once a member
    pub fn set_join_token(&self, token: Option<String>) {
        *self.join_token.write() = token;
    }

    fn admits(&self, parameter: &Value) -> bool {
        let presented = parameter
            .get("join_token")
            .and_then(Value::as_str)
            .unwrap_or_default();
        self.join_token
            .read()
            .as_deref()
            .is_some_and(|expected| join_token_matches(presented, expected))
    }

    pub fn profile(&self) -> Profile {
        self.profile.read().clone()
    }

    pub fn set_profile(&self, profile: Profile) {
        *self.profile.write() = profile;
    }

    fn manager(&self) -> Result<Arc<WorkerSocketManager>> {
        self.sockets
            .upgrade()
            .ok_or_else(|| Error::Internal("worker socket manager is gone".to_string()))
    }

    // ─────────────────────────────────────────────────────────────
    // Local Side
    // ─────────────────────────────────────────────────────────────

    /// Ask the member behind `connect_settings` to admit this worker
    pub async fn join(
        &self,
        interface: &str,
        connect_settings: &Value,
        profile: Profile,
    ) -> Result<WorkerId> {
        let current = self.directory.my_worker_id();
        if current != PROSPECTIVE_WORKER_ID {
            return Err(Error::Internal(format!(
                "already a member as worker {}",
                current
            )));
        }

        let parameter = match self.join_token.read().clone() {
            Some(token) => json!({ "join_token": token }),
            None => Value::Null,
        };
        let socket = self
            .manager()?
            .open_via(
                interface,
                connect_settings,
                PROSPECTIVE_WORKER_ID,
                MEMBERSHIP_PURPOSE,
                parameter,
            )
            .await?;
        let answer = socket
            .call_once(FN_JOIN, serde_json::to_value(&profile)?)
            .await;
        socket.close();
        let admission: Admission = serde_json::from_value(answer?)?;

        let secret = admission.authenticity_data;
        let peers = admission
            .peers
            .into_iter()
            .map(|(id, peer)| {
                let mut peer = peer.without_secrets();
                peer.pairwise_key = derive_pairwise_key(&secret, id);
                (id, peer)
            })
            .collect();
        self.directory.import_peers(peers)?;
        self.directory.import_my_identity(admission.worker_id, secret);
        self.set_profile(profile);
        info!(
            worker_id = admission.worker_id,
            admitted_by = socket.remote_worker_id(),
            "Joined shoal"
        );
        Ok(admission.worker_id)
    }

    /// Publish a new profile to every known peer
    pub async fn update(&self, profile: Profile) -> Result<GroupOutcome> {
        self.directory
            .my_identity()
            .ok_or(Error::NotAuthenticated)?;
        self.set_profile(profile.clone());
        let outcome = self
            .notify_all(FN_UPDATE, serde_json::to_value(&profile)?, None)
            .await;
        info!(
            finished = outcome.finished.len(),
            failed = outcome.failed.len(),
            "Published profile update"
        );
        Ok(outcome)
    }

    /// Tell every known peer this worker leaves, then forget the shoal
    pub async fn leave(&self) -> Result<GroupOutcome> {
        let me = self
            .directory
            .my_identity()
            .ok_or(Error::NotAuthenticated)?;
        let outcome = self.notify_all(FN_LEAVE, Value::Null, None).await;
        self.directory.clear();
        self.directory.forget_my_identity();
        info!(worker_id = me.worker_id, "Left shoal");
        Ok(outcome)
    }

    async fn notify_all(
        &self,
        function: &str,
        parameter: Value,
        skip: Option<WorkerId>,
    ) -> GroupOutcome {
        self.notify_each(function, |_| Ok(parameter.clone()), skip)
            .await
    }

    /// Send `function` to every known peer with a parameter built per peer
    async fn notify_each<F>(
        &self,
        function: &str,
        parameter_for: F,
        skip: Option<WorkerId>,
    ) -> GroupOutcome
    where
        F: Fn(WorkerId) -> Result<Value>,
    {
        let targets: Vec<WorkerId> = self
            .directory
            .worker_ids()
            .into_iter()
            .filter(|id| Some(*id) != skip)
            .collect();
        let results = join_all(targets.iter().map(|&peer| {
            let parameter = parameter_for(peer);
            async move {
                let result = match parameter {
                    Ok(parameter) => self.notify(peer, function, parameter).await,
                    Err(e) => Err(e),
                };
                (peer, result)
            }
        }))
        .await;

        let mut outcome = GroupOutcome::default();
        for (peer, result) in results {
            match result {
                Ok(()) => outcome.finished.push(peer),
                Err(e) => {
                    debug!(peer, function, error = %e, "Membership notice not delivered");
                    outcome.failed.insert(peer, e.to_string());
                }
            }
        }
        outcome.finished.sort_unstable();
        outcome
    }

    async fn notify(&self, peer: WorkerId, function: &str, parameter: Value) -> Result<()> {
        let socket = self
            .manager()?
            .open(peer, MEMBERSHIP_PURPOSE, Value::Null)
            .await?;
        let result = socket.call_once(function, parameter).await;
        socket.close();
        result.map(|_| ())
    }

    // ─────────────────────────────────────────────────────────────
    // Remote Side
    // ─────────────────────────────────────────────────────────────

    async fn admit(self: Arc<Self>, profile: Profile) -> Result<Value> {
        let me = self
            .directory
            .my_identity()
            .ok_or(Error::NotAuthenticated)?;
        let worker_id = self.directory.next_free_worker_id();
        let secret = generate_authenticity_data();
        let newcomer = WorkerPeer {
            worker_id,
            connectors: profile.connectors,
            detail: profile.detail,
            authenticity_data: Vec::new(),
            pairwise_key: Vec::new(),
        };

        let mut peers: BTreeMap<WorkerId, WorkerPeer> = self
            .directory
            .all_peers()
            .into_iter()
            .map(|(id, peer)| (id, peer.without_secrets()))
            .collect();
        let mine = self.profile();
        peers.insert(
            me.worker_id,
            WorkerPeer {
                worker_id: me.worker_id,
                connectors: mine.connectors,
                detail: mine.detail,
                authenticity_data: Vec::new(),
                pairwise_key: Vec::new(),
            },
        );
        self.directory.join(WorkerPeer {
            pairwise_key: derive_pairwise_key(&secret, me.worker_id),
            ..newcomer.clone()
        })?;
        info!(worker_id, "Admitted new worker");

        let pairwise_secret = secret.clone();
        let membership = Arc::clone(&self);
        tokio::spawn(async move {
            let announcement_for = |peer: WorkerId| -> Result<Value> {
                let announced = WorkerPeer {
                    pairwise_key: derive_pairwise_key(&pairwise_secret, peer),
                    ..newcomer.clone()
                };
                Ok(serde_json::to_value(&announced)?)
            };
            let outcome = membership
                .notify_each(FN_JOINED, announcement_for, Some(worker_id))
                .await;
            if !outcome.all_finished() {
                warn!(
                    worker_id,
                    unreached = ?outcome.failed.keys().collect::<Vec<_>>(),
                    "Some members did not hear of the new worker"
                );
            }
        });

        Ok(serde_json::to_value(Admission {
            worker_id,
            authenticity_data: secret,
            peers,
        })?)
    }

    fn apply(&self, from: WorkerId, function: &str, parameter: Value) -> Result<Value> {
        match function {
            FN_JOINED => {
                let peer: WorkerPeer = serde_json::from_value(parameter)?;
                if peer.worker_id == self.directory.my_worker_id() {
                    return Err(Error::Internal("announced worker is this worker".to_string()));
                }
                info!(worker_id = peer.worker_id, announced_by = from, "Peer joined");
                self.directory.join(peer)?;
            }
            FN_UPDATE => {
                let profile: Profile = serde_json::from_value(parameter)?;
                self.directory
                    .update(from, profile.connectors, profile.detail)?;
                info!(worker_id = from, "Peer updated");
            }
            FN_LEAVE => {
                self.directory.leave(from);
                info!(worker_id = from, "Peer left");
            }
            other => return Err(Error::FunctionNotDefined(other.to_string())),
        }
        Ok(Value::Null)
    }
}

/// Socket handler for [`MEMBERSHIP_PURPOSE`]; holds the membership weakly
pub struct MembershipHandler {
    membership: Weak<Membership>,
}

impl MembershipHandler {
    pub fn new(membership: &Arc<Membership>) -> Self {
        Self {
            membership: Arc::downgrade(membership),
        }
    }
}

#[async_trait]
impl WorkerSocketHandler for MembershipHandler {
    fn authorize(&self, worker_id: WorkerId, parameter: &Value) -> bool {
        if worker_id != PROSPECTIVE_WORKER_ID {
            return true;
        }
        let admitted = self
            .membership
            .upgrade()
            .is_some_and(|m| m.admits(parameter));
        if !admitted {
            warn!("Join refused: join token missing or wrong");
        }
        admitted
    }

    async fn on_create(&self, socket: WorkerSocket) {
        let from = socket.remote_worker_id();
        let result = if from == PROSPECTIVE_WORKER_ID {
            let membership = self.membership.clone();
            socket.define(FN_JOIN, move |parameter: Value, responder: CallResponder| {
                let membership = membership.clone();
                async move {
                    let answer = match membership.upgrade() {
                        Some(m) => match serde_json::from_value::<Profile>(parameter) {
                            Ok(profile) => m.admit(profile).await,
                            Err(e) => Err(e.into()),
                        },
                        None => Err(Error::Internal("worker is shutting down".to_string())),
                    };
                    respond(responder, answer);
                }
            })
        } else {
            [FN_JOINED, FN_UPDATE, FN_LEAVE]
                .into_iter()
                .try_for_each(|function| {
                    let membership = self.membership.clone();
                    socket.define(function, move |parameter: Value, responder: CallResponder| {
                        let answer = match membership.upgrade() {
                            Some(m) => m.apply(from, function, parameter),
                            None => Err(Error::Internal("worker is shutting down".to_string())),
                        };
                        async move { respond(responder, answer) }
                    })
                })
        };
        if let Err(e) = result {
            warn!(worker_id = from, error = %e, "Membership socket not served");
            socket.close();
        }
    }
}

fn respond(responder: CallResponder, answer: Result<Value>) {
    let sent = match answer {
        Ok(value) => responder.return_data(value),
        Err(e) => responder.return_error(e.to_string()),
    };
    if let Err(e) = sent {
        debug!(error = %e, "Membership answer not sent");
    }
}
