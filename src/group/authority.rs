//! Locker and sync-queue
//!
//! The state of each named primitive lives on one authority member, drawn
//! from the shared seed over the sorted member list and the primitive name.
//! Every member computes the same authority, so no election is needed.
//!
//! - Locker: FIFO mutual exclusion. A holder whose link drops loses the lock.
//! - Sync-queue: items leave in push order, to poppers in request order.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};
use crate::peer::WorkerId;

use super::channel::Channel;
use super::frame::RequestKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum AuthorityOp {
    Lock { name: String },
    Unlock { name: String },
    Push { name: String, item: Value },
    Pop { name: String },
}

#[derive(Default)]
struct LockState {
    holder: Option<WorkerId>,
    waiters: VecDeque<(WorkerId, oneshot::Sender<()>)>,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Value>,
    poppers: VecDeque<(WorkerId, oneshot::Sender<Value>)>,
}

#[derive(Default)]
struct AuthorityTables {
    locks: HashMap<String, LockState>,
    queues: HashMap<String, QueueState>,
}

/// Primitive state held while this member is the authority
#[derive(Default)]
pub(crate) struct AuthorityState {
    tables: Mutex<AuthorityTables>,
}

impl AuthorityState {
    /// `None` when granted at once, otherwise a receiver that fires on grant
    fn lock(&self, name: &str, who: WorkerId) -> Result<Option<oneshot::Receiver<()>>> {
        let mut tables = self.tables.lock();
        let state = tables.locks.entry(name.to_string()).or_default();
        match state.holder {
            None => {
                state.holder = Some(who);
                Ok(None)
            }
            Some(holder) if holder == who => Err(Error::Internal(format!(
                "worker {} already holds lock '{}'",
                who, name
            ))),
            Some(_) => {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back((who, tx));
                Ok(Some(rx))
            }
        }
    }

    fn unlock(&self, name: &str, who: WorkerId) -> Result<()> {
        let mut tables = self.tables.lock();
        let state = tables
            .locks
            .get_mut(name)
            .filter(|s| s.holder == Some(who))
            .ok_or_else(|| {
                Error::Internal(format!("worker {} does not hold lock '{}'", who, name))
            })?;
        Self::grant_next(state);
        Ok(())
    }

    fn grant_next(state: &mut LockState) {
        state.holder = None;
        while let Some((waiter, tx)) = state.waiters.pop_front() {
            if tx.send(()).is_ok() {
                state.holder = Some(waiter);
                return;
            }
        }
    }

    fn push(&self, name: &str, item: Value) {
        let mut tables = self.tables.lock();
        let state = tables.queues.entry(name.to_string()).or_default();
        let mut item = item;
        while let Some((_, tx)) = state.poppers.pop_front() {
            match tx.send(item) {
                Ok(()) => return,
                // That popper went away; offer the item to the next one
                Err(returned) => item = returned,
            }
        }
        state.items.push_back(item);
    }

    fn pop(&self, name: &str, who: WorkerId) -> std::result::Result<Value, oneshot::Receiver<Value>> {
        let mut tables = self.tables.lock();
        let state = tables.queues.entry(name.to_string()).or_default();
        match state.items.pop_front() {
            Some(item) => Ok(item),
            None => {
                let (tx, rx) = oneshot::channel();
                state.poppers.push_back((who, tx));
                Err(rx)
            }
        }
    }

    /// Forget a member whose link dropped: release its locks, drop its waits
    pub(crate) fn release_peer(&self, who: WorkerId) {
        let mut tables = self.tables.lock();
        for (name, state) in tables.locks.iter_mut() {
            state.waiters.retain(|(waiter, _)| *waiter != who);
            if state.holder == Some(who) {
                debug!(lock = %name, worker_id = who, "Releasing lock of departed holder");
                Self::grant_next(state);
            }
        }
        for state in tables.queues.values_mut() {
            state.poppers.retain(|(popper, _)| *popper != who);
        }
    }

    pub(crate) fn lock_holder(&self, name: &str) -> Option<WorkerId> {
        self.tables.lock().locks.get(name).and_then(|s| s.holder)
    }

    pub(crate) fn queue_len(&self, name: &str) -> usize {
        self.tables
            .lock()
            .queues
            .get(name)
            .map(|s| s.items.len())
            .unwrap_or(0)
    }
}

// ─────────────────────────────────────────────────────────────────
// Channel Surface
// ─────────────────────────────────────────────────────────────────

impl Channel {
    /// The member holding the state of primitive `name`
    pub fn authority_for(&self, name: &str) -> Result<WorkerId> {
        let context = format!("authority:{}:{}", self.id(), name);
        let mut random = self.inner.context.seed.stream(&context)?;
        random
            .choose(self.members())
            .copied()
            .ok_or_else(|| Error::Internal(format!("channel {} has no members", self.id())))
    }

    pub fn locker(&self, name: &str) -> Locker {
        Locker {
            channel: self.clone(),
            name: name.to_string(),
        }
    }

    pub fn sync_queue(&self, name: &str) -> SyncQueue {
        SyncQueue {
            channel: self.clone(),
            name: name.to_string(),
        }
    }

    async fn authority_call(&self, name: &str, op: AuthorityOp) -> Result<Value> {
        let authority = self.authority_for(name)?;
        let me = self.my_worker_id();
        if authority == me {
            self.run_authority(me, op).await
        } else {
            let payload = serde_json::to_value(&op)?;
            self.request_kind(authority, RequestKind::Authority, payload)
                .await
        }
    }

    pub(crate) async fn serve_authority(&self, from: WorkerId, payload: Value) -> Result<Value> {
        let op: AuthorityOp = serde_json::from_value(payload)?;
        let name = match &op {
            AuthorityOp::Lock { name }
            | AuthorityOp::Unlock { name }
            | AuthorityOp::Push { name, .. }
            | AuthorityOp::Pop { name } => name.clone(),
        };
        if self.authority_for(&name)? != self.my_worker_id() {
            return Err(Error::Internal(format!(
                "worker {} is not the authority for '{}'",
                self.my_worker_id(),
                name
            )));
        }
        self.run_authority(from, op).await
    }

    async fn run_authority(&self, who: WorkerId, op: AuthorityOp) -> Result<Value> {
        let state = &self.inner.authority;
        match op {
            AuthorityOp::Lock { name } => {
                if let Some(granted) = state.lock(&name, who)? {
                    granted
                        .await
                        .map_err(|_| Error::Internal(format!("lock '{}' request dropped", name)))?;
                }
                Ok(Value::Null)
            }
            AuthorityOp::Unlock { name } => state.unlock(&name, who).map(|_| Value::Null),
            AuthorityOp::Push { name, item } => {
                state.push(&name, item);
                Ok(Value::Null)
            }
            AuthorityOp::Pop { name } => match state.pop(&name, who) {
                Ok(item) => Ok(item),
                Err(waiting) => waiting
                    .await
                    .map_err(|_| Error::Internal(format!("pop from '{}' dropped", name))),
            },
        }
    }
}

/// Group-wide mutual exclusion by name
pub struct Locker {
    channel: Channel,
    name: String,
}

impl Locker {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait until this worker holds the lock
    pub async fn lock(&self) -> Result<()> {
        self.channel
            .authority_call(
                &self.name,
                AuthorityOp::Lock {
                    name: self.name.clone(),
                },
            )
            .await
            .map(|_| ())
    }

    pub async fn unlock(&self) -> Result<()> {
        self.channel
            .authority_call(
                &self.name,
                AuthorityOp::Unlock {
                    name: self.name.clone(),
                },
            )
            .await
            .map(|_| ())
    }

    /// Holder as seen by this worker, when it is the authority
    pub fn local_holder(&self) -> Option<WorkerId> {
        self.channel.inner.authority.lock_holder(&self.name)
    }
}

/// Group-wide FIFO hand-off by name
pub struct SyncQueue {
    channel: Channel,
    name: String,
}

impl SyncQueue {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn push(&self, item: Value) -> Result<()> {
        self.channel
            .authority_call(
                &self.name,
                AuthorityOp::Push {
                    name: self.name.clone(),
                    item,
                },
            )
            .await
            .map(|_| ())
    }

    /// Wait for the next item
    pub async fn pop(&self) -> Result<Value> {
        self.channel
            .authority_call(
                &self.name,
                AuthorityOp::Pop {
                    name: self.name.clone(),
                },
            )
            .await
    }

    /// Items waiting, when this worker is the authority
    pub fn local_len(&self) -> usize {
        self.channel.inner.authority.queue_len(&self.name)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
