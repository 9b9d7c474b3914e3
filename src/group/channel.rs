//! Channels: a fixed member set operated on as a unit
//!
//! A channel holds at most one live link (a tunnel under protocol `0x02`) per
//! remote member, opened on first use. Every operation is a request over a
//! link answered by exactly one response, so a fan-out completes once each
//! targeted member has either answered or lost its link.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::peer::WorkerId;
use crate::tunnel::{Tunnel, TunnelEvent, TunnelReceiver, TunnelSender};

use super::authority::AuthorityState;
use super::frame::{ChannelDescriptor, ChannelId, GroupFrame, Outcome, RequestKind};
use super::manager::GroupContext;
use super::variable::VariableState;

/// Application side of a channel. Every method has a default, so handlers
/// implement only the patterns they take part in.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn on_broadcast(&self, _from: WorkerId, _payload: Value) {}

    async fn on_request(&self, _from: WorkerId, _payload: Value) -> Result<Value> {
        Err(Error::call_error("channel does not serve requests"))
    }

    /// First leg of a synchronize; the returned value is the synchronize acknowledgment
    async fn on_synchronize(&self, _from: WorkerId, _payload: Value) -> Result<Value> {
        Err(Error::call_error("channel does not serve synchronize"))
    }

    /// Final acknowledgment of a synchronize this side answered
    async fn on_acknowledge(&self, _from: WorkerId, _payload: Value) {}
}

/// Per-peer verdict from a multicast responder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirm {
    Finished,
    Failed,
    Retry,
}

/// Result of a group operation once every targeted member has reported
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupOutcome {
    /// Members that completed, ascending
    pub finished: Vec<WorkerId>,
    /// Members that did not, with the reason
    pub failed: BTreeMap<WorkerId, String>,
}

impl GroupOutcome {
    pub fn total(&self) -> usize {
        self.finished.len() + self.failed.len()
    }

    pub fn all_finished(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Per-peer state after the first leg of a broadcast synchronize
#[derive(Debug, Clone, PartialEq)]
pub enum SyncStatus {
    Responded(Value),
    Failed(String),
}

#[derive(Clone)]
pub(crate) struct Link {
    id: u64,
    peer: WorkerId,
    sender: TunnelSender,
}

struct Pending {
    link: u64,
    peer: WorkerId,
    tx: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct RequestTable {
    live_links: HashSet<u64>,
    pending: HashMap<u64, Pending>,
}

pub(crate) struct ChannelInner {
    descriptor: ChannelDescriptor,
    pub(crate) context: Arc<GroupContext>,
    handler: RwLock<Option<Arc<dyn ChannelHandler>>>,
    links: Mutex<HashMap<WorkerId, Link>>,
    connecting: Mutex<HashMap<WorkerId, Arc<tokio::sync::Mutex<()>>>>,
    requests: Mutex<RequestTable>,
    next_request_id: AtomicU64,
    next_link_id: AtomicU64,
    pub(crate) variables: Mutex<HashMap<String, VariableState>>,
    pub(crate) authority: AuthorityState,
}

/// Handle to one channel; clones share it
#[derive(Clone)]
pub struct Channel {
    pub(crate) inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("descriptor", &self.inner.descriptor)
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(descriptor: ChannelDescriptor, context: Arc<GroupContext>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                descriptor,
                context,
                handler: RwLock::new(None),
                links: Mutex::new(HashMap::new()),
                connecting: Mutex::new(HashMap::new()),
                requests: Mutex::new(RequestTable::default()),
                next_request_id: AtomicU64::new(1),
                next_link_id: AtomicU64::new(1),
                variables: Mutex::new(HashMap::new()),
                authority: AuthorityState::default(),
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.inner.descriptor.id
    }

    pub fn purpose(&self) -> &str {
        &self.inner.descriptor.purpose
    }

    /// All members including this worker, ascending
    pub fn members(&self) -> &[WorkerId] {
        &self.inner.descriptor.members
    }

    pub fn descriptor(&self) -> &ChannelDescriptor {
        &self.inner.descriptor
    }

    pub(crate) fn my_worker_id(&self) -> WorkerId {
        self.inner.context.directory.my_worker_id()
    }

    /// Members other than this worker
    pub fn remote_members(&self) -> Vec<WorkerId> {
        let me = self.my_worker_id();
        self.members().iter().copied().filter(|m| *m != me).collect()
    }

    pub fn is_member(&self, worker_id: WorkerId) -> bool {
        self.members().binary_search(&worker_id).is_ok()
    }

    /// Attach the application handler; a channel has exactly one
    pub fn set_handler(&self, handler: Arc<dyn ChannelHandler>) -> Result<()> {
        let mut slot = self.inner.handler.write();
        if slot.is_some() {
            return Err(Error::Internal(format!(
                "channel {} already has a handler",
                self.id()
            )));
        }
        *slot = Some(handler);
        Ok(())
    }

    fn handler(&self) -> Option<Arc<dyn ChannelHandler>> {
        self.inner.handler.read().clone()
    }

    /// Members with a live link right now
    pub fn linked_members(&self) -> Vec<WorkerId> {
        let mut linked: Vec<_> = self.inner.links.lock().keys().copied().collect();
        linked.sort_unstable();
        linked
    }

    /// Close every link
    pub fn close(&self) {
        let links: Vec<Link> = self.inner.links.lock().drain().map(|(_, l)| l).collect();
        for link in links {
            link.sender.close();
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────────

    /// Deliver `payload` to every other member
    pub async fn broadcast(&self, payload: Value) -> GroupOutcome {
        let targets = self.remote_members();
        let outcome = self
            .fan_out(&targets, RequestKind::Broadcast, payload, |_, result| {
                if result.is_ok() {
                    Confirm::Finished
                } else {
                    Confirm::Failed
                }
            })
            .await;
        info!(
            channel = %self.id(),
            finished = outcome.finished.len(),
            failed = outcome.failed.len(),
            "Broadcast finished"
        );
        outcome
    }

    /// Request-response with one member
    pub async fn request(&self, peer: WorkerId, payload: Value) -> Result<Value> {
        self.request_kind(peer, RequestKind::Request, payload).await
    }

    /// Request every listed member; `confirm` judges each response as it arrives
    pub async fn multicast_request<F>(
        &self,
        peers: &[WorkerId],
        payload: Value,
        confirm: F,
    ) -> GroupOutcome
    where
        F: FnMut(WorkerId, Result<Value>) -> Confirm,
    {
        self.fan_out(peers, RequestKind::Request, payload, confirm)
            .await
    }

    /// [`multicast_request`](Self::multicast_request) to every other member
    pub async fn broadcast_request<F>(&self, payload: Value, confirm: F) -> GroupOutcome
    where
        F: FnMut(WorkerId, Result<Value>) -> Confirm,
    {
        let targets = self.remote_members();
        self.fan_out(&targets, RequestKind::Request, payload, confirm)
            .await
    }

    /// First two legs of a synchronize with one member
    pub async fn synchronize(&self, peer: WorkerId, payload: Value) -> Result<Synchronized> {
        let (link, request_id, response) = self
            .exchange(peer, RequestKind::Synchronize, payload)
            .await?;
        Ok(Synchronized {
            channel: self.clone(),
            link,
            request_id,
            response,
        })
    }

    /// Synchronize with every other member; acknowledge through the returned round
    pub async fn broadcast_synchronize(&self, payload: Value) -> SynchronizeRound {
        let targets = self.remote_members();
        let mut inflight: FuturesUnordered<_> = targets
            .iter()
            .map(|&peer| self.tagged_request(peer, RequestKind::Synchronize, payload.clone()))
            .collect();

        let mut statuses = BTreeMap::new();
        let mut legs = HashMap::new();
        while let Some((peer, result)) = inflight.next().await {
            let status = match result {
                Ok((link, request_id, response)) => {
                    legs.insert(peer, (link, request_id));
                    SyncStatus::Responded(response)
                }
                Err(e) => SyncStatus::Failed(e.to_string()),
            };
            statuses.insert(peer, status);
        }
        SynchronizeRound {
            channel: self.clone(),
            statuses,
            legs,
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Requests
    // ─────────────────────────────────────────────────────────────

    pub(crate) async fn fan_out<F>(
        &self,
        peers: &[WorkerId],
        kind: RequestKind,
        payload: Value,
        mut confirm: F,
    ) -> GroupOutcome
    where
        F: FnMut(WorkerId, Result<Value>) -> Confirm,
    {
        let max_retries = self.inner.context.settings.max_request_retries;
        let mut retries: HashMap<WorkerId, u32> = HashMap::new();
        let mut outcome = GroupOutcome::default();

        let mut targets: Vec<WorkerId> = peers.to_vec();
        targets.sort_unstable();
        targets.dedup();

        let mut inflight: FuturesUnordered<_> = targets
            .iter()
            .map(|&peer| self.tagged_request(peer, kind, payload.clone()))
            .collect();

        while let Some((peer, result)) = inflight.next().await {
            let result = result.map(|(_, _, response)| response);
            let reason = result.as_ref().err().map(|e| e.to_string());
            match confirm(peer, result) {
                Confirm::Finished => outcome.finished.push(peer),
                Confirm::Failed => {
                    let reason = reason.unwrap_or_else(|| "response refused".to_string());
                    outcome.failed.insert(peer, reason);
                }
                Confirm::Retry => {
                    let attempts = retries.entry(peer).or_insert(0);
                    if *attempts < max_retries {
                        *attempts += 1;
                        debug!(channel = %self.id(), peer, attempt = *attempts, "Retrying request");
                        inflight.push(self.tagged_request(peer, kind, payload.clone()));
                    } else {
                        outcome
                            .failed
                            .insert(peer, format!("gave up after {} retries", max_retries));
                    }
                }
            }
        }

        outcome.finished.sort_unstable();
        outcome
    }

    async fn tagged_request(
        &self,
        peer: WorkerId,
        kind: RequestKind,
        payload: Value,
    ) -> (WorkerId, Result<(Link, u64, Value)>) {
        (peer, self.exchange(peer, kind, payload).await)
    }

    pub(crate) async fn request_kind(
        &self,
        peer: WorkerId,
        kind: RequestKind,
        payload: Value,
    ) -> Result<Value> {
        self.exchange(peer, kind, payload)
            .await
            .map(|(_, _, response)| response)
    }

    /// Send one request and wait for its response; returns the link and request id too
    async fn exchange(
        &self,
        peer: WorkerId,
        kind: RequestKind,
        payload: Value,
    ) -> Result<(Link, u64, Value)> {
        if !self.is_member(peer) {
            return Err(Error::GroupRequestFailed {
                worker_id: peer,
                message: format!("not a member of channel {}", self.id()),
            });
        }
        let link = self.link(peer).await?;
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.inner.requests.lock();
            if !table.live_links.contains(&link.id) {
                return Err(Error::TunnelClosed);
            }
            table.pending.insert(
                request_id,
                Pending {
                    link: link.id,
                    peer,
                    tx,
                },
            );
        }

        let frame = GroupFrame::Request {
            request_id,
            kind,
            payload,
        };
        if let Err(e) = send(&link, &frame) {
            self.inner.requests.lock().pending.remove(&request_id);
            return Err(e);
        }
        let response = rx.await.map_err(|_| Error::TunnelClosed)??;
        Ok((link, request_id, response))
    }

    /// Send on `link` only while it is still the live link to its peer
    fn send_on(&self, link: &Link, frame: &GroupFrame) -> Result<()> {
        let current = self.live_link(link.peer).map(|l| l.id) == Some(link.id);
        if !current || !self.inner.requests.lock().live_links.contains(&link.id) {
            return Err(Error::TunnelClosed);
        }
        send(link, frame)
    }

    // ─────────────────────────────────────────────────────────────
    // Links
    // ─────────────────────────────────────────────────────────────

    fn live_link(&self, peer: WorkerId) -> Option<Link> {
        self.inner
            .links
            .lock()
            .get(&peer)
            .filter(|l| !l.sender.is_closed())
            .cloned()
    }

    /// The live link to `peer`, opening one if needed
    async fn link(&self, peer: WorkerId) -> Result<Link> {
        if peer == self.my_worker_id() {
            return Err(Error::Internal("a channel has no link to itself".to_string()));
        }
        if let Some(link) = self.live_link(peer) {
            return Ok(link);
        }

        let gate = Arc::clone(self.inner.connecting.lock().entry(peer).or_default());
        let _connecting = gate.lock().await;
        if let Some(link) = self.live_link(peer) {
            return Ok(link);
        }

        let tunnel = self
            .inner
            .context
            .open_link(peer, &self.inner.descriptor)
            .await?;
        Ok(self.attach(peer, tunnel))
    }

    /// Adopt a handshaken tunnel as the link to `peer` and start reading it
    pub(crate) fn attach(&self, peer: WorkerId, tunnel: Tunnel) -> Link {
        let (_, sender, receiver) = tunnel.into_parts();
        let link = Link {
            id: self.inner.next_link_id.fetch_add(1, Ordering::Relaxed),
            peer,
            sender,
        };
        self.inner.requests.lock().live_links.insert(link.id);
        if let Some(previous) = self.inner.links.lock().insert(peer, link.clone()) {
            debug!(channel = %self.id(), peer, old_link = previous.id, "Link replaced");
        }
        info!(channel = %self.id(), peer, link = link.id, "Channel link up");
        tokio::spawn(read_link(self.clone(), link.clone(), receiver));
        link
    }

    fn link_closed(&self, link: &Link) {
        {
            let mut links = self.inner.links.lock();
            if links.get(&link.peer).map(|l| l.id) == Some(link.id) {
                links.remove(&link.peer);
            }
        }

        let failed: Vec<Pending> = {
            let mut table = self.inner.requests.lock();
            table.live_links.remove(&link.id);
            let ids: Vec<u64> = table
                .pending
                .iter()
                .filter(|(_, p)| p.link == link.id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| table.pending.remove(&id))
                .collect()
        };
        for pending in failed {
            let _ = pending.tx.send(Err(Error::PeerUnreachable {
                worker_id: pending.peer,
                message: "channel link closed".to_string(),
            }));
        }

        if self.live_link(link.peer).is_none() {
            self.inner.authority.release_peer(link.peer);
        }
        info!(channel = %self.id(), peer = link.peer, link = link.id, "Channel link down");
    }

    // ─────────────────────────────────────────────────────────────
    // Serving
    // ─────────────────────────────────────────────────────────────

    fn handle_frame(&self, link: &Link, frame: GroupFrame) {
        match frame {
            GroupFrame::Request {
                request_id,
                kind,
                payload,
            } => {
                let channel = self.clone();
                let link = link.clone();
                tokio::spawn(async move {
                    let result = channel.serve(link.peer, kind, payload).await;
                    let response = GroupFrame::Response {
                        request_id,
                        outcome: Outcome::from_result(result),
                    };
                    if let Err(e) = send(&link, &response) {
                        debug!(channel = %channel.id(), peer = link.peer, error = %e, "Response not sent");
                    }
                });
            }
            GroupFrame::Response {
                request_id,
                outcome,
            } => {
                let pending = self.inner.requests.lock().pending.remove(&request_id);
                match pending {
                    Some(pending) => {
                        let _ = pending.tx.send(outcome.into_result(pending.peer));
                    }
                    None => debug!(channel = %self.id(), request_id, "Response to unknown request"),
                }
            }
            GroupFrame::Acknowledge {
                request_id,
                payload,
            } => {
                let Some(handler) = self.handler() else {
                    return;
                };
                let peer = link.peer;
                debug!(channel = %self.id(), peer, request_id, "Synchronize acknowledged");
                tokio::spawn(async move {
                    handler.on_acknowledge(peer, payload).await;
                });
            }
        }
    }

    async fn serve(&self, from: WorkerId, kind: RequestKind, payload: Value) -> Result<Value> {
        match kind {
            RequestKind::Broadcast => {
                if let Some(handler) = self.handler() {
                    handler.on_broadcast(from, payload).await;
                }
                Ok(Value::Null)
            }
            RequestKind::Request => match self.handler() {
                Some(handler) => handler.on_request(from, payload).await,
                None => Err(Error::call_error("channel has no handler")),
            },
            RequestKind::Synchronize => match self.handler() {
                Some(handler) => handler.on_synchronize(from, payload).await,
                None => Err(Error::call_error("channel has no handler")),
            },
            RequestKind::Variable => self.serve_variable(payload),
            RequestKind::Authority => self.serve_authority(from, payload).await,
        }
    }
}

fn send(link: &Link, frame: &GroupFrame) -> Result<()> {
    link.sender.send_nowait(frame.to_bytes()?)
}

async fn read_link(channel: Channel, link: Link, mut receiver: TunnelReceiver) {
    while let Some(event) = receiver.next_event().await {
        match event {
            TunnelEvent::Data(bytes) => match GroupFrame::from_bytes(&bytes) {
                Ok(frame) => channel.handle_frame(&link, frame),
                Err(e) => {
                    warn!(channel = %channel.id(), peer = link.peer, error = %e, "Malformed group frame");
                    link.sender.close();
                    break;
                }
            },
            TunnelEvent::Error(message) => {
                debug!(channel = %channel.id(), peer = link.peer, error = %message, "Link error");
                break;
            }
        }
    }
    channel.link_closed(&link);
}

// ─────────────────────────────────────────────────────────────────
// Synchronize Results
// ─────────────────────────────────────────────────────────────────

/// A member answered the first leg; the final acknowledgment is still due
pub struct Synchronized {
    channel: Channel,
    link: Link,
    request_id: u64,
    response: Value,
}

impl Synchronized {
    pub fn peer(&self) -> WorkerId {
        self.link.peer
    }

    /// The member's synchronize acknowledgment
    pub fn response(&self) -> &Value {
        &self.response
    }

    /// Send the final acknowledgment on the link that carried the synchronize.
    ///
    /// Fails with [`Error::TunnelClosed`] once that link is gone; a new link's
    /// peer never saw the request.
    pub async fn acknowledge(self, payload: Value) -> Result<()> {
        let frame = GroupFrame::Acknowledge {
            request_id: self.request_id,
            payload,
        };
        self.channel.send_on(&self.link, &frame)
    }
}

/// Per-member outcome of the first legs of a broadcast synchronize
pub struct SynchronizeRound {
    channel: Channel,
    statuses: BTreeMap<WorkerId, SyncStatus>,
    legs: HashMap<WorkerId, (Link, u64)>,
}

impl SynchronizeRound {
    pub fn statuses(&self) -> &BTreeMap<WorkerId, SyncStatus> {
        &self.statuses
    }

    /// Send each responding member the acknowledgment `decide` picks for it
    pub async fn acknowledge_each<F>(self, mut decide: F) -> GroupOutcome
    where
        F: FnMut(WorkerId, &Value) -> Value,
    {
        let mut outcome = GroupOutcome::default();
        for (peer, status) in &self.statuses {
            match status {
                SyncStatus::Responded(response) => {
                    let Some((link, request_id)) = self.legs.get(peer) else {
                        outcome.failed.insert(*peer, "no synchronize leg".to_string());
                        continue;
                    };
                    let frame = GroupFrame::Acknowledge {
                        request_id: *request_id,
                        payload: decide(*peer, response),
                    };
                    match self.channel.send_on(link, &frame) {
                        Ok(()) => outcome.finished.push(*peer),
                        Err(e) => {
                            outcome.failed.insert(*peer, e.to_string());
                        }
                    }
                }
                SyncStatus::Failed(reason) => {
                    outcome.failed.insert(*peer, reason.clone());
                }
            }
        }
        outcome
    }
}
