//! Worker sockets: streaming RPC between two authenticated workers
//!
//! A [`WorkerSocket`] owns one tunnel. A dispatcher task decodes incoming
//! [`SocketFrame`]s and routes them:
//!
//! - calls to the function handlers registered with [`WorkerSocket::define`],
//!   each in its own task
//! - returned and yielded values to the [`ValueStream`] of the waiting call
//! - acknowledgments back to the producer that asked for them
//!
//! Closing the tunnel is the only cancellation: every open call and yielding
//! session then ends with [`Error::TunnelClosed`].

pub mod frame;
pub mod manager;
pub mod stream;

pub use frame::*;
pub use manager::*;
pub use stream::{
    Acknowledger, CallResponder, StreamEvent, ValueStream, YieldingRequest, YieldingSender,
};

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::codec::Callable;
use crate::error::{Error, Result};
use crate::peer::WorkerId;
use crate::tunnel::{Tunnel, TunnelEvent, TunnelReceiver};

use stream::{Inbound, SocketCore};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

type FunctionHandler = Arc<dyn Fn(Value, CallResponder) -> BoxFuture<'static, ()> + Send + Sync>;
type YieldingHandler = Arc<dyn Fn(YieldingRequest) -> BoxFuture<'static, ()> + Send + Sync>;

struct SocketInner {
    id: u64,
    purpose: String,
    parameter: Value,
    remote_worker_id: WorkerId,
    core: Arc<SocketCore>,
    functions: RwLock<HashMap<String, FunctionHandler>>,
    yielding_handlers: RwLock<HashMap<String, YieldingHandler>>,
    receiver: Mutex<Option<TunnelReceiver>>,
}

/// Handle to one worker socket; clones share the session
#[derive(Clone)]
pub struct WorkerSocket {
    inner: Arc<SocketInner>,
}

impl WorkerSocket {
    /// Wrap a handshaken tunnel; nothing is read until [`start`](Self::start)
    pub(crate) fn new(
        tunnel: Tunnel,
        purpose: String,
        parameter: Value,
        remote_worker_id: WorkerId,
        max_frame_bytes: usize,
    ) -> Self {
        let (_, sender, receiver) = tunnel.into_parts();
        Self {
            inner: Arc::new(SocketInner {
                id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
                purpose,
                parameter,
                remote_worker_id,
                core: Arc::new(SocketCore::new(sender, max_frame_bytes)),
                functions: RwLock::new(HashMap::new()),
                yielding_handlers: RwLock::new(HashMap::new()),
                receiver: Mutex::new(Some(receiver)),
            }),
        }
    }

    /// Start the dispatcher; later calls do nothing
    pub(crate) fn start(&self) {
        if let Some(receiver) = self.inner.receiver.lock().take() {
            tokio::spawn(dispatch(Arc::clone(&self.inner), receiver));
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn purpose(&self) -> &str {
        &self.inner.purpose
    }

    pub fn parameter(&self) -> &Value {
        &self.inner.parameter
    }

    pub fn remote_worker_id(&self) -> WorkerId {
        self.inner.remote_worker_id
    }

    // ─────────────────────────────────────────────────────────────
    // Functions
    // ─────────────────────────────────────────────────────────────

    /// Register a function the remote side can call
    pub fn define<F, Fut>(&self, function: &str, handler: F) -> Result<()>
    where
        F: Fn(Value, CallResponder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut functions = self.inner.functions.write();
        if functions.contains_key(function) {
            return Err(Error::Internal(format!(
                "function '{}' is already defined",
                function
            )));
        }
        let handler: FunctionHandler =
            Arc::new(move |parameter, responder| handler(parameter, responder).boxed());
        functions.insert(function.to_string(), handler);
        Ok(())
    }

    pub fn undefine(&self, function: &str) -> bool {
        self.inner.functions.write().remove(function).is_some()
    }

    /// Call a remote function; values arrive on the returned stream
    pub fn call(&self, function: &str, parameter: Value) -> Result<ValueStream> {
        let core = &self.inner.core;
        let (call_id, rx) = core.open_call()?;
        let frame = SocketFrame::Call {
            call_id,
            function: function.to_string(),
            parameter,
        };
        let stream = ValueStream::new(Arc::clone(core), Inlet::Call(call_id), rx);
        core.send_frame(&frame)?;
        debug!(socket = self.id(), call_id, function, "Call sent");
        Ok(stream)
    }

    /// Call and wait for the final value, acknowledging yields as they come
    pub async fn call_once(&self, function: &str, parameter: Value) -> Result<Value> {
        self.call(function, parameter)?.collect_final().await
    }

    /// Call a function the remote side handed us as a callable value
    pub fn invoke(&self, callable: &Callable, parameter: Value) -> Result<ValueStream> {
        self.call(&callable.function, parameter)
    }

    // ─────────────────────────────────────────────────────────────
    // Yielding Fields
    // ─────────────────────────────────────────────────────────────

    /// Register the handler for a named yielding field
    pub fn handle_yielding<F, Fut>(&self, field: &str, handler: F) -> Result<()>
    where
        F: Fn(YieldingRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut handlers = self.inner.yielding_handlers.write();
        if handlers.contains_key(field) {
            return Err(Error::Internal(format!(
                "field '{}' already has a yielding handler",
                field
            )));
        }
        let handler: YieldingHandler = Arc::new(move |request| handler(request).boxed());
        handlers.insert(field.to_string(), handler);
        Ok(())
    }

    /// Ask the remote field handler to get ready, then stream values to it
    pub async fn start_yielding(&self, field: &str, parameter: Value) -> Result<YieldingSender> {
        let core = &self.inner.core;
        let rx = core.begin_start(field)?;
        let guard = StartGuard {
            core: Arc::clone(core),
            field,
            armed: true,
        };
        core.send_frame(&SocketFrame::StartYielding {
            field: field.to_string(),
            parameter,
        })?;

        let outcome = rx.await;
        guard.disarm();
        match outcome {
            Ok(Ok(ready)) => Ok(YieldingSender::new(Arc::clone(core), field.to_string(), ready)),
            Ok(Err(message)) => Err(Error::call_error(message)),
            Err(_) => Err(Error::TunnelClosed),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────

    /// Close the socket and its tunnel
    pub fn close(&self) {
        self.inner.core.close_tunnel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.core.is_closed()
    }

    /// Resolves once the socket is closed, by either side
    pub async fn closed(&self) {
        let mut rx = self.inner.core.subscribe_closed();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl std::fmt::Debug for WorkerSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSocket")
            .field("id", &self.inner.id)
            .field("purpose", &self.inner.purpose)
            .field("remote_worker_id", &self.inner.remote_worker_id)
            .finish()
    }
}

/// Releases a field reservation if `start_yielding` is abandoned mid-way
struct StartGuard<'a> {
    core: Arc<SocketCore>,
    field: &'a str,
    armed: bool,
}

impl StartGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.core.abandon_start(self.field);
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────

async fn dispatch(inner: Arc<SocketInner>, mut receiver: TunnelReceiver) {
    while let Some(event) = receiver.next_event().await {
        match event {
            TunnelEvent::Data(bytes) => match SocketFrame::from_bytes(&bytes) {
                Ok(frame) => route(&inner, frame),
                Err(e) => {
                    warn!(socket = inner.id, error = %e, "Malformed frame, closing socket");
                    break;
                }
            },
            TunnelEvent::Error(message) => {
                warn!(socket = inner.id, error = %message, "Tunnel error");
                break;
            }
        }
    }
    inner.core.shutdown();
    inner.core.close_tunnel();
    info!(
        socket = inner.id,
        purpose = %inner.purpose,
        remote_worker_id = inner.remote_worker_id,
        "Worker socket closed"
    );
}

fn route(inner: &SocketInner, frame: SocketFrame) {
    let core = &inner.core;
    match frame {
        SocketFrame::Call {
            call_id,
            function,
            parameter,
        } => {
            let responder = CallResponder::new(Arc::clone(core), call_id);
            let handler = inner.functions.read().get(&function).cloned();
            match handler {
                Some(handler) => {
                    tokio::spawn(handler(parameter, responder));
                }
                None => {
                    debug!(socket = inner.id, function = %function, "Call to undefined function");
                    let _ = responder.return_error(Error::FunctionNotDefined(function).to_string());
                }
            }
        }
        SocketFrame::CallAck {
            call_id,
            ack_id,
            data,
        } => core.resolve_ack(Outlet::Call(call_id), ack_id, data),
        SocketFrame::CallAbandon { call_id } => core.abandon_outlet(Outlet::Call(call_id)),
        SocketFrame::CallData {
            call_id,
            data,
            ack_id,
        } => core.route_call(call_id, Inbound::Data { data, ack_id }),
        SocketFrame::CallReturn { call_id, data } => core.route_call(call_id, Inbound::Final(data)),
        SocketFrame::CallFail { call_id, message } => {
            core.route_call(call_id, Inbound::Fail(message))
        }

        SocketFrame::StartYielding { field, parameter } => {
            if core.has_inbound_field(&field) {
                let _ = core.send_frame(&SocketFrame::RejectYielding {
                    field,
                    message: "field is already yielding".to_string(),
                });
                return;
            }
            let handler = inner.yielding_handlers.read().get(&field).cloned();
            let request = YieldingRequest::new(Arc::clone(core), field, parameter);
            match handler {
                Some(handler) => {
                    tokio::spawn(handler(request));
                }
                None => {
                    let _ = request.reject("no yielding handler for this field");
                }
            }
        }
        SocketFrame::YieldData { field, data, ack_id } => {
            core.route_field(&field, Inbound::Data { data, ack_id })
        }
        SocketFrame::YieldFinish { field, data } => core.route_field(&field, Inbound::Final(data)),
        SocketFrame::YieldFail { field, message } => {
            core.route_field(&field, Inbound::Fail(message))
        }

        SocketFrame::ReadyYielding { field, data } => core.resolve_start(&field, Ok(data)),
        SocketFrame::RejectYielding { field, message } => {
            core.resolve_start(&field, Err(message))
        }
        SocketFrame::YieldAck {
            field,
            ack_id,
            data,
        } => core.resolve_ack(Outlet::Field(field), ack_id, data),
        SocketFrame::YieldAbandon { field } => core.abandon_outlet(Outlet::Field(field)),
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
