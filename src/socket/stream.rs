//! Value streams of a worker socket
//!
//! Both interaction shapes (calls and yielding fields) are one producer
//! streaming values to one consumer:
//!
//! - the producer ([`CallResponder`], [`YieldingSender`]) emits zero or more
//!   values, optionally asking for an acknowledgment, then exactly one
//!   terminal value or error
//! - the consumer ([`ValueStream`]) reads them in send order and answers
//!   acknowledgment requests through an [`Acknowledger`]
//!
//! A producer with an unanswered acknowledgment request refuses further
//! values with [`Error::YieldPending`]. Dropping an unfinished consumer tells
//! the producer, whose pending and later values then fail with
//! [`Error::CallError`]. Dropping an unfinished producer sends
//! a failure, and a closed tunnel ends every open stream with
//! [`Error::TunnelClosed`], so each session gets exactly one terminal outcome.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::error::{Error, Result};
use crate::tunnel::TunnelSender;

use super::frame::{Inlet, Outlet, SocketFrame};

/// One value delivered to a consumer
pub(crate) enum Inbound {
    Data { data: Value, ack_id: Option<u64> },
    Final(Value),
    Fail(String),
}

// ─────────────────────────────────────────────────────────────────
// Session Tables
// ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct SessionTables {
    closed: bool,
    /// Our outgoing calls, by call id
    calls: HashMap<u64, mpsc::UnboundedSender<Inbound>>,
    /// Fields the remote side is yielding to us
    fields: HashMap<String, mpsc::UnboundedSender<Inbound>>,
    /// Fields we asked to start, waiting for ready or reject
    starting: HashMap<String, oneshot::Sender<std::result::Result<Value, String>>>,
    /// Fields we are yielding on
    yielding: HashSet<String>,
    /// Calls we are answering
    answering: HashSet<u64>,
    /// Outstanding acknowledgment request per producer
    acks: HashMap<Outlet, (u64, oneshot::Sender<Value>)>,
    /// Live producers whose consumer went away
    abandoned: HashSet<Outlet>,
}

/// State shared by a worker socket and all of its streams
pub(crate) struct SocketCore {
    sender: TunnelSender,
    tables: Mutex<SessionTables>,
    next_call_id: AtomicU64,
    next_ack_id: AtomicU64,
    closed: watch::Sender<bool>,
    max_frame_bytes: usize,
}

impl SocketCore {
    pub(crate) fn new(sender: TunnelSender, max_frame_bytes: usize) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            sender,
            tables: Mutex::new(SessionTables::default()),
            next_call_id: AtomicU64::new(1),
            next_ack_id: AtomicU64::new(1),
            closed,
            max_frame_bytes,
        }
    }

    pub(crate) fn send_frame(&self, frame: &SocketFrame) -> Result<()> {
        if self.tables.lock().closed {
            return Err(Error::TunnelClosed);
        }
        let bytes = frame.to_bytes()?;
        if bytes.len() > self.max_frame_bytes {
            return Err(Error::malformed(format!(
                "frame of {} bytes exceeds the {} byte limit",
                bytes.len(),
                self.max_frame_bytes
            )));
        }
        self.sender.send_nowait(bytes)
    }

    pub(crate) fn close_tunnel(&self) {
        self.sender.close();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tables.lock().closed
    }

    pub(crate) fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// End every open session; called once when the tunnel closes
    pub(crate) fn shutdown(&self) {
        let dropped = {
            let mut tables = self.tables.lock();
            let dropped = std::mem::take(&mut *tables);
            tables.closed = true;
            dropped
        };
        let open = dropped.calls.len() + dropped.fields.len() + dropped.starting.len();
        if open > 0 {
            debug!(open, "Ending sessions on closed socket");
        }
        // Dropping the senders ends every waiting stream and acknowledgment
        drop(dropped);
        self.closed.send_replace(true);
    }

    // ── calls (caller side) ─────────────────────────────────────

    pub(crate) fn open_call(&self) -> Result<(u64, mpsc::UnboundedReceiver<Inbound>)> {
        let mut tables = self.tables.lock();
        if tables.closed {
            return Err(Error::TunnelClosed);
        }
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        tables.calls.insert(call_id, tx);
        Ok((call_id, rx))
    }

    pub(crate) fn route_call(&self, call_id: u64, inbound: Inbound) {
        let mut tables = self.tables.lock();
        let terminal = !matches!(inbound, Inbound::Data { .. });
        let delivered = if terminal {
            tables.calls.remove(&call_id).map(|tx| tx.send(inbound).is_ok())
        } else {
            tables.calls.get(&call_id).map(|tx| tx.send(inbound).is_ok())
        };
        if delivered != Some(true) {
            debug!(call_id, "Dropping value for a call nobody waits on");
        }
    }

    fn forget_call(&self, call_id: u64) {
        self.tables.lock().calls.remove(&call_id);
    }

    // ── yielding fields (handler side) ──────────────────────────

    pub(crate) fn has_inbound_field(&self, field: &str) -> bool {
        self.tables.lock().fields.contains_key(field)
    }

    fn open_inbound_field(&self, field: &str) -> Result<mpsc::UnboundedReceiver<Inbound>> {
        let mut tables = self.tables.lock();
        if tables.closed {
            return Err(Error::TunnelClosed);
        }
        if tables.fields.contains_key(field) {
            return Err(Error::Internal(format!("field '{}' is already yielding", field)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tables.fields.insert(field.to_string(), tx);
        Ok(rx)
    }

    pub(crate) fn route_field(&self, field: &str, inbound: Inbound) {
        let mut tables = self.tables.lock();
        let terminal = !matches!(inbound, Inbound::Data { .. });
        let delivered = if terminal {
            tables.fields.remove(field).map(|tx| tx.send(inbound).is_ok())
        } else {
            tables.fields.get(field).map(|tx| tx.send(inbound).is_ok())
        };
        if delivered != Some(true) {
            debug!(field, "Dropping value for a field nobody reads");
        }
    }

    fn forget_field(&self, field: &str) {
        self.tables.lock().fields.remove(field);
    }

    // ── yielding fields (starter side) ──────────────────────────

    pub(crate) fn begin_start(
        &self,
        field: &str,
    ) -> Result<oneshot::Receiver<std::result::Result<Value, String>>> {
        let mut tables = self.tables.lock();
        if tables.closed {
            return Err(Error::TunnelClosed);
        }
        if tables.yielding.contains(field) || tables.starting.contains_key(field) {
            return Err(Error::Internal(format!("already yielding on field '{}'", field)));
        }
        let (tx, rx) = oneshot::channel();
        tables.starting.insert(field.to_string(), tx);
        tables.yielding.insert(field.to_string());
        Ok(rx)
    }

    pub(crate) fn resolve_start(&self, field: &str, outcome: std::result::Result<Value, String>) {
        let mut tables = self.tables.lock();
        if outcome.is_err() {
            tables.yielding.remove(field);
        }
        match tables.starting.remove(field) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => debug!(field, "Yielding answer for a field we did not start"),
        }
    }

    pub(crate) fn abandon_start(&self, field: &str) {
        let mut tables = self.tables.lock();
        tables.starting.remove(field);
        tables.yielding.remove(field);
    }

    // ── producers ───────────────────────────────────────────────

    fn open_answer(&self, call_id: u64) {
        self.tables.lock().answering.insert(call_id);
    }

    /// The consumer of `outlet` stopped reading; fail its producer
    pub(crate) fn abandon_outlet(&self, outlet: Outlet) {
        let mut tables = self.tables.lock();
        let live = match &outlet {
            Outlet::Call(call_id) => tables.answering.contains(call_id),
            Outlet::Field(field) => tables.yielding.contains(field),
        };
        if !live {
            debug!(session = %outlet.describe(), "Abandon for a finished session");
            return;
        }
        debug!(session = %outlet.describe(), "Consumer abandoned the stream");
        // Dropping the pending sender wakes a producer waiting on its acknowledgment
        tables.acks.remove(&outlet);
        tables.abandoned.insert(outlet);
    }

    fn is_abandoned(&self, outlet: &Outlet) -> bool {
        self.tables.lock().abandoned.contains(outlet)
    }

    // ── acknowledgments (producer side) ─────────────────────────

    fn register_ack(&self, outlet: Outlet, ack_id: u64, tx: oneshot::Sender<Value>) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.closed {
            return Err(Error::TunnelClosed);
        }
        if tables.abandoned.contains(&outlet) {
            return Err(abandoned_error(&outlet));
        }
        tables.acks.insert(outlet, (ack_id, tx));
        Ok(())
    }

    pub(crate) fn resolve_ack(&self, outlet: Outlet, ack_id: u64, data: Value) {
        let mut tables = self.tables.lock();
        match tables.acks.remove(&outlet) {
            Some((expected, tx)) if expected == ack_id => {
                let _ = tx.send(data);
            }
            Some(entry) => {
                debug!(session = %outlet.describe(), ack_id, "Stale acknowledgment ignored");
                tables.acks.insert(outlet, entry);
            }
            None => debug!(session = %outlet.describe(), ack_id, "Unexpected acknowledgment"),
        }
    }

    fn release_outlet(&self, outlet: &Outlet) {
        let mut tables = self.tables.lock();
        tables.acks.remove(outlet);
        tables.abandoned.remove(outlet);
        match outlet {
            Outlet::Call(call_id) => {
                tables.answering.remove(call_id);
            }
            Outlet::Field(field) => {
                tables.yielding.remove(field);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Producers
// ─────────────────────────────────────────────────────────────────

fn abandoned_error(outlet: &Outlet) -> Error {
    Error::call_error(format!("{} was abandoned by the consumer", outlet.describe()))
}

struct Producer {
    core: Arc<SocketCore>,
    outlet: Outlet,
    pending_ack: Option<oneshot::Receiver<Value>>,
    finished: bool,
}

impl Producer {
    fn new(core: Arc<SocketCore>, outlet: Outlet) -> Self {
        Self {
            core,
            outlet,
            pending_ack: None,
            finished: false,
        }
    }

    fn ensure_ready(&mut self) -> Result<()> {
        if self.finished {
            return Err(Error::Internal(format!(
                "{} already finished",
                self.outlet.describe()
            )));
        }
        if self.core.is_abandoned(&self.outlet) {
            self.pending_ack = None;
            return Err(abandoned_error(&self.outlet));
        }
        if let Some(rx) = self.pending_ack.as_mut() {
            match rx.try_recv() {
                Ok(_) => self.pending_ack = None,
                Err(TryRecvError::Empty) => {
                    return Err(Error::YieldPending {
                        session: self.outlet.describe(),
                    })
                }
                Err(TryRecvError::Closed) => {
                    self.pending_ack = None;
                    return Err(self.closed_error());
                }
            }
        }
        Ok(())
    }

    fn yield_data(&mut self, data: Value) -> Result<()> {
        self.ensure_ready()?;
        self.core.send_frame(&self.outlet.data(data, None))
    }

    fn begin_yield_with_ack(&mut self, data: Value) -> Result<()> {
        self.ensure_ready()?;
        let ack_id = self.core.next_ack_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.core.register_ack(self.outlet.clone(), ack_id, tx)?;
        self.pending_ack = Some(rx);
        self.core.send_frame(&self.outlet.data(data, Some(ack_id)))
    }

    async fn acknowledged(&mut self) -> Result<Value> {
        let Some(rx) = self.pending_ack.as_mut() else {
            return Err(Error::Internal(format!(
                "{} has no acknowledgment pending",
                self.outlet.describe()
            )));
        };
        let answer = rx.await;
        self.pending_ack = None;
        answer.map_err(|_| self.closed_error())
    }

    /// Error for an acknowledgment that will never come
    fn closed_error(&self) -> Error {
        if self.core.is_abandoned(&self.outlet) {
            abandoned_error(&self.outlet)
        } else {
            Error::TunnelClosed
        }
    }

    fn finish(&mut self, data: Value) -> Result<()> {
        self.ensure_ready()?;
        self.finished = true;
        self.core.release_outlet(&self.outlet);
        self.core.send_frame(&self.outlet.finish(data))
    }

    fn fail(&mut self, message: String) -> Result<()> {
        if self.finished {
            return Err(Error::Internal(format!(
                "{} already finished",
                self.outlet.describe()
            )));
        }
        self.finished = true;
        let abandoned = self.core.is_abandoned(&self.outlet);
        self.core.release_outlet(&self.outlet);
        if abandoned {
            return Ok(());
        }
        self.core.send_frame(&self.outlet.fail(message))
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if !self.finished {
            let message = match &self.outlet {
                Outlet::Call(_) => "handler ended without returning a value".to_string(),
                Outlet::Field(_) => "yielding ended without finish".to_string(),
            };
            let _ = self.fail(message);
        }
    }
}

/// Responder side of one call, handed to the function handler
pub struct CallResponder {
    call_id: u64,
    producer: Producer,
}

impl CallResponder {
    pub(crate) fn new(core: Arc<SocketCore>, call_id: u64) -> Self {
        core.open_answer(call_id);
        Self {
            call_id,
            producer: Producer::new(core, Outlet::Call(call_id)),
        }
    }

    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    /// Send a non-final value
    pub fn yield_data(&mut self, data: Value) -> Result<()> {
        self.producer.yield_data(data)
    }

    /// Send a non-final value and wait for the caller's acknowledgment
    pub async fn yield_data_with_ack(&mut self, data: Value) -> Result<Value> {
        self.producer.begin_yield_with_ack(data)?;
        self.producer.acknowledged().await
    }

    /// Send a non-final value that needs acknowledging, without waiting.
    /// Further values are refused until [`acknowledged`](Self::acknowledged) resolves.
    pub fn begin_yield_with_ack(&mut self, data: Value) -> Result<()> {
        self.producer.begin_yield_with_ack(data)
    }

    pub async fn acknowledged(&mut self) -> Result<Value> {
        self.producer.acknowledged().await
    }

    /// Send the final value; ends the call
    pub fn return_data(mut self, data: Value) -> Result<()> {
        self.producer.finish(data)
    }

    /// End the call with an error for the caller
    pub fn return_error(mut self, message: impl Into<String>) -> Result<()> {
        self.producer.fail(message.into())
    }
}

/// Starter side of a yielding field once the handler is ready
pub struct YieldingSender {
    field: String,
    ready: Value,
    producer: Producer,
}

impl YieldingSender {
    pub(crate) fn new(core: Arc<SocketCore>, field: String, ready: Value) -> Self {
        Self {
            producer: Producer::new(core, Outlet::Field(field.clone())),
            field,
            ready,
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Payload the handler supplied when it became ready
    pub fn ready_data(&self) -> &Value {
        &self.ready
    }

    pub fn yield_data(&mut self, data: Value) -> Result<()> {
        self.producer.yield_data(data)
    }

    pub async fn yield_data_with_ack(&mut self, data: Value) -> Result<Value> {
        self.producer.begin_yield_with_ack(data)?;
        self.producer.acknowledged().await
    }

    pub fn begin_yield_with_ack(&mut self, data: Value) -> Result<()> {
        self.producer.begin_yield_with_ack(data)
    }

    pub async fn acknowledged(&mut self) -> Result<Value> {
        self.producer.acknowledged().await
    }

    /// Send the last value; ends the field session
    pub fn finish_yield(mut self, data: Value) -> Result<()> {
        self.producer.finish(data)
    }

    pub fn fail(mut self, message: impl Into<String>) -> Result<()> {
        self.producer.fail(message.into())
    }
}

/// A request to start yielding, handed to the field handler
pub struct YieldingRequest {
    core: Arc<SocketCore>,
    field: String,
    parameter: Value,
    answered: bool,
}

impl YieldingRequest {
    pub(crate) fn new(core: Arc<SocketCore>, field: String, parameter: Value) -> Self {
        Self {
            core,
            field,
            parameter,
            answered: false,
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn parameter(&self) -> &Value {
        &self.parameter
    }

    /// Confirm readiness; `data` reaches the starter, values follow on the stream
    pub fn ready_yielding(mut self, data: Value) -> Result<ValueStream> {
        let rx = self.core.open_inbound_field(&self.field)?;
        let frame = SocketFrame::ReadyYielding {
            field: self.field.clone(),
            data,
        };
        if let Err(e) = self.core.send_frame(&frame) {
            self.core.forget_field(&self.field);
            return Err(e);
        }
        self.answered = true;
        Ok(ValueStream::new(
            Arc::clone(&self.core),
            Inlet::Field(self.field.clone()),
            rx,
        ))
    }

    pub fn reject(mut self, message: impl Into<String>) -> Result<()> {
        self.answered = true;
        self.core.send_frame(&SocketFrame::RejectYielding {
            field: self.field.clone(),
            message: message.into(),
        })
    }
}

impl Drop for YieldingRequest {
    fn drop(&mut self) {
        if !self.answered {
            let _ = self.core.send_frame(&SocketFrame::RejectYielding {
                field: self.field.clone(),
                message: "yielding handler did not get ready".to_string(),
            });
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Consumers
// ─────────────────────────────────────────────────────────────────

/// Answers one acknowledgment request; usable once
pub struct Acknowledger {
    core: Arc<SocketCore>,
    inlet: Inlet,
    ack_id: u64,
}

impl Acknowledger {
    pub fn acknowledge(self, data: Value) -> Result<()> {
        self.core.send_frame(&self.inlet.ack(self.ack_id, data))
    }
}

impl fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledger")
            .field("inlet", &self.inlet)
            .field("ack_id", &self.ack_id)
            .finish()
    }
}

/// One value as seen by the consumer
#[derive(Debug)]
pub struct StreamEvent {
    pub data: Value,
    pub is_final: bool,
    /// Present when the producer waits for an acknowledgment of this value
    pub acknowledge: Option<Acknowledger>,
}

/// Ordered values of one call or yielding field
pub struct ValueStream {
    core: Arc<SocketCore>,
    inlet: Inlet,
    rx: mpsc::UnboundedReceiver<Inbound>,
    finished: bool,
}

impl ValueStream {
    pub(crate) fn new(
        core: Arc<SocketCore>,
        inlet: Inlet,
        rx: mpsc::UnboundedReceiver<Inbound>,
    ) -> Self {
        Self {
            core,
            inlet,
            rx,
            finished: false,
        }
    }

    /// Next value or terminal error; `None` after the terminal outcome
    pub async fn next(&mut self) -> Option<Result<StreamEvent>> {
        if self.finished {
            return None;
        }
        let event = match self.rx.recv().await {
            Some(Inbound::Data { data, ack_id }) => Ok(StreamEvent {
                data,
                is_final: false,
                acknowledge: ack_id.map(|ack_id| Acknowledger {
                    core: Arc::clone(&self.core),
                    inlet: self.inlet.clone(),
                    ack_id,
                }),
            }),
            Some(Inbound::Final(data)) => {
                self.finished = true;
                Ok(StreamEvent {
                    data,
                    is_final: true,
                    acknowledge: None,
                })
            }
            Some(Inbound::Fail(message)) => {
                self.finished = true;
                Err(Error::call_error(message))
            }
            None => {
                self.finished = true;
                Err(Error::TunnelClosed)
            }
        };
        Some(event)
    }

    /// Drain to the final value, acknowledging every request with `null`
    pub async fn collect_final(mut self) -> Result<Value> {
        loop {
            match self.next().await {
                Some(Ok(event)) => {
                    if let Some(ack) = event.acknowledge {
                        ack.acknowledge(Value::Null)?;
                    }
                    if event.is_final {
                        return Ok(event.data);
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Err(Error::TunnelClosed),
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Drop for ValueStream {
    fn drop(&mut self) {
        if !self.finished {
            match &self.inlet {
                Inlet::Call(call_id) => self.core.forget_call(*call_id),
                Inlet::Field(field) => self.core.forget_field(field),
            }
            let _ = self.core.send_frame(&self.inlet.abandon());
        }
    }
}
