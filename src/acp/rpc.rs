//! JSON-RPC request/response correlation.
//!
//! `RpcRouter` assigns ids, keeps the open-request table and resolves calls
//! as responses arrive. Requests and notifications initiated by the agent are
//! not handled here: the pump task forwards them, in arrival order, over a
//! bounded channel to whoever owns the session.
//!
//! The router is `Rc`-shared and lives on the `LocalSet` thread. Its table is
//! only touched between suspension points, so `RefCell` borrows never span an
//! `.await`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::acp::error::{AcpError, Result};
use crate::acp::message::{Message, Notification, Request, RequestId, RpcError};
use crate::acp::transport::{ExitInfo, Incoming, Outbound, TransportEvent};

/// Capacity of the channel carrying agent-initiated messages.
const DISPATCH_CAPACITY: usize = 64;

/// Agent-initiated traffic, in the order the transport produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Request(Request),
    Notification(Notification),
    /// The transport ended. Every pending call has already failed.
    Closed(ExitInfo),
}

struct PendingRequest {
    method: String,
    created_at: Instant,
    slot: oneshot::Sender<Result<Value>>,
}

struct RouterState {
    outbound: Outbound,
    next_id: Cell<u64>,
    pending: RefCell<HashMap<u64, PendingRequest>>,
    /// Set once the transport is gone; later calls fail immediately.
    closed: RefCell<Option<String>>,
}

#[derive(Clone)]
pub struct RpcRouter {
    inner: Rc<RouterState>,
}

impl RpcRouter {
    pub fn new(outbound: Outbound) -> Self {
        Self {
            inner: Rc::new(RouterState {
                outbound,
                next_id: Cell::new(1),
                pending: RefCell::new(HashMap::new()),
                closed: RefCell::new(None),
            }),
        }
    }

    /// Build a router over `incoming` and start the pump task.
    ///
    /// Returns the router, the receiver for agent-initiated traffic and the
    /// pump handle. Must be called inside a `LocalSet`.
    pub fn attach(
        outbound: Outbound,
        incoming: Incoming,
    ) -> (RpcRouter, mpsc::Receiver<Inbound>, JoinHandle<()>) {
        let router = RpcRouter::new(outbound);
        let (tx, rx) = mpsc::channel(DISPATCH_CAPACITY);
        let pump = tokio::task::spawn_local(pump(router.clone(), incoming, tx));
        (router, rx, pump)
    }

    /// Send a request and wait for its response.
    ///
    /// A JSON-RPC error object comes back as `AcpError::Rpc`; transport loss
    /// while waiting comes back as `AcpError::Transport`.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let slot = self.start_call(method, params)?;
        match slot.await {
            Ok(outcome) => outcome,
            Err(_) => Err(AcpError::Transport(format!(
                "request '{method}' was dropped without a response"
            ))),
        }
    }

    fn start_call(&self, method: &str, params: Value) -> Result<oneshot::Receiver<Result<Value>>> {
        if let Some(reason) = self.inner.closed.borrow().as_ref() {
            return Err(AcpError::Transport(reason.clone()));
        }

        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);

        let (slot, rx) = oneshot::channel();
        self.inner.pending.borrow_mut().insert(
            id,
            PendingRequest {
                method: method.to_string(),
                created_at: Instant::now(),
                slot,
            },
        );

        tracing::trace!(id, method, "-> request");
        if let Err(e) = self.inner.outbound.send(Message::request(id, method, params)) {
            self.inner.pending.borrow_mut().remove(&id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Fire-and-forget notification.
    pub fn notify(&self, method: &str, params: Value) -> Result<()> {
        tracing::trace!(method, "-> notification");
        self.inner
            .outbound
            .send(Message::notification(method, params))
    }

    /// Answer an agent-initiated request.
    pub fn respond(&self, id: RequestId, outcome: std::result::Result<Value, RpcError>) -> Result<()> {
        tracing::trace!(%id, ok = outcome.is_ok(), "-> response");
        self.inner.outbound.send(Message::response(id, outcome))
    }

    /// Route one decoded message.
    ///
    /// Responses resolve their pending call and yield `None`; requests and
    /// notifications are handed back for dispatch.
    pub fn on_inbound(&self, message: Message) -> Option<Inbound> {
        match message {
            Message::Response(response) => {
                self.resolve(response.id, response.outcome);
                None
            }
            Message::Request(request) => {
                tracing::trace!(id = %request.id, method = %request.method, "<- request");
                Some(Inbound::Request(request))
            }
            Message::Notification(notification) => {
                tracing::trace!(method = %notification.method, "<- notification");
                Some(Inbound::Notification(notification))
            }
        }
    }

    fn resolve(&self, id: RequestId, outcome: std::result::Result<Value, RpcError>) {
        let pending = match id {
            RequestId::Number(n) => self.inner.pending.borrow_mut().remove(&n),
            RequestId::Text(_) => None,
        };
        let Some(pending) = pending else {
            tracing::warn!(%id, "dropping response with unknown id");
            return;
        };

        tracing::trace!(
            %id,
            method = %pending.method,
            elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
            "<- response"
        );
        let method = pending.method;
        let outcome = outcome.map_err(|error| AcpError::Rpc { method, error });
        // The caller may have given up on this call; that is not an error.
        let _ = pending.slot.send(outcome);
    }

    /// Fail every open call and refuse new ones.
    pub fn fail_all(&self, reason: &str) {
        self.inner
            .closed
            .borrow_mut()
            .get_or_insert_with(|| reason.to_string());
        let drained: Vec<_> = self.inner.pending.borrow_mut().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), reason, "failing pending requests");
        }
        for (_, pending) in drained {
            let _ = pending.slot.send(Err(AcpError::Transport(format!(
                "'{}' failed: {reason}",
                pending.method
            ))));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.borrow().is_some()
    }
}

/// Drive `incoming` through the router until the stream ends.
async fn pump(router: RpcRouter, mut incoming: Incoming, tx: mpsc::Sender<Inbound>) {
    while let Some(event) = incoming.next().await {
        match event {
            TransportEvent::Message(message) => {
                if let Some(inbound) = router.on_inbound(message) {
                    if tx.send(inbound).await.is_err() {
                        break;
                    }
                }
            }
            TransportEvent::Closed(info) => {
                router.fail_all(&info.to_string());
                let _ = tx.send(Inbound::Closed(info)).await;
                return;
            }
        }
    }
    router.fail_all("agent stream ended");
}
