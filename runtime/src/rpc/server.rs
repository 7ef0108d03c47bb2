use super::call::{Call, Delivery, ReplyTo};
use crate::recover;
use dashmap::DashSet;
use module_kit_protocol::{Protocol, RpcError};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio::sync::oneshot;

/// A registered function.
pub type Handler<S, P> = Box<
    dyn Fn(&mut S, <P as Protocol>::Command) -> Result<<P as Protocol>::Reply, RpcError> + Send,
>;

/// Consumer half of an RPC server: handler table plus the call queue.
///
/// Handlers run on whichever loop owns this value, with `&mut S` of that
/// loop's state. Callers only ever see a [`ServerHandle`].
pub struct Server<S, P: Protocol> {
    handlers: HashMap<P::Id, Handler<S, P>>,
    calls: mpsc::Receiver<Call<P>>,
    handle: ServerHandle<P>,
    return_timeout: Duration,
    dropped_returns: usize,
    closed: bool,
}

impl<S, P: Protocol> Server<S, P> {
    /// `queue_len` is clamped to at least 1.
    pub fn new(queue_len: usize, return_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(queue_len.max(1));
        Self {
            handlers: HashMap::new(),
            calls: rx,
            handle: ServerHandle {
                calls: tx,
                registered: Arc::new(DashSet::new()),
            },
            return_timeout,
            dropped_returns: 0,
            closed: false,
        }
    }

    pub fn handle(&self) -> ServerHandle<P> {
        self.handle.clone()
    }

    /// Register `handler` under `id`.
    ///
    /// # Panics
    /// If `id` already has a handler.
    pub fn register<F>(&mut self, id: P::Id, handler: F)
    where
        F: Fn(&mut S, P::Command) -> Result<P::Reply, RpcError> + Send + 'static,
    {
        if self.handlers.contains_key(&id) {
            panic!("function id {:?}: already registered", id);
        }
        self.handle.registered.insert(id.clone());
        self.handlers.insert(id, Box::new(handler));
    }

    pub fn is_registered(&self, id: &P::Id) -> bool {
        self.handlers.contains_key(id)
    }

    /// Next queued call, `None` once closed and drained.
    pub async fn recv(&mut self) -> Option<Call<P>> {
        self.calls.recv().await
    }

    /// Execute one call and deliver its outcome.
    ///
    /// A panicking handler is recovered and its caller gets
    /// [`RpcError::Panic`].
    ///
    /// # Panics
    /// If no handler exists for the call's id. Callers validate ids before
    /// enqueueing, so this only trips on a wiring bug.
    pub async fn exec(&mut self, state: &mut S, call: Call<P>) {
        let Call { command, reply } = call;
        let id = P::id(&command);

        let result = {
            let handler = match self.handlers.get(&id) {
                Some(handler) => handler,
                None => panic!("function id {:?}: function not registered", id),
            };
            match recover::recover(|| handler(state, command)) {
                Ok(result) => result,
                Err(fault) => {
                    fault.log(&format!("function id {:?}", id));
                    Err(fault.into_rpc_error())
                }
            }
        };

        self.respond(reply, result).await;
    }

    /// Serve calls until the queue is closed. For servers that are not
    /// multiplexed with other sources.
    pub async fn serve(&mut self, state: &mut S) {
        while let Some(call) = self.recv().await {
            self.exec(state, call).await;
        }
    }

    /// Stop accepting calls and answer every queued one with
    /// [`RpcError::ServerClosed`]. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.calls.close();

        let mut drained = 0usize;
        while let Some(call) = self.calls.recv().await {
            drained += 1;
            self.respond(call.reply, Err(RpcError::ServerClosed)).await;
        }
        if drained > 0 {
            tracing::debug!("server closed with {} queued calls", drained);
        }
    }

    /// Async returns that could not be delivered within the return timeout.
    /// Replies to callers that already closed are not counted.
    pub fn dropped_returns(&self) -> usize {
        self.dropped_returns
    }

    async fn respond(&mut self, reply: ReplyTo<P::Reply>, result: Result<P::Reply, RpcError>) {
        match reply.deliver(result, self.return_timeout).await {
            Delivery::Delivered => {}
            Delivery::Dropped => {
                self.dropped_returns += 1;
                tracing::warn!(
                    dropped = self.dropped_returns,
                    "async return dropped, caller's return queue is full"
                );
            }
            Delivery::CallerGone => tracing::debug!("caller gone before its reply"),
        }
    }
}

/// Producer half of an RPC server. Cheap to clone; every clone targets the
/// same queue.
pub struct ServerHandle<P: Protocol> {
    calls: mpsc::Sender<Call<P>>,
    registered: Arc<DashSet<P::Id>>,
}

impl<P: Protocol> Clone for ServerHandle<P> {
    fn clone(&self) -> Self {
        Self {
            calls: self.calls.clone(),
            registered: self.registered.clone(),
        }
    }
}

impl<P: Protocol> fmt::Debug for ServerHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("registered", &self.registered.len())
            .field("queued", &self.queued())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<P: Protocol> ServerHandle<P> {
    pub fn is_registered(&self, id: &P::Id) -> bool {
        self.registered.contains(id)
    }

    pub fn is_closed(&self) -> bool {
        self.calls.is_closed()
    }

    /// Calls currently waiting in the queue.
    pub fn queued(&self) -> usize {
        self.calls.max_capacity() - self.calls.capacity()
    }

    /// Synchronous call: enqueue (waiting for room) and wait for the reply.
    pub async fn call(&self, command: P::Command) -> Result<P::Reply, RpcError> {
        let id = P::id(&command);
        if !self.is_registered(&id) {
            return Err(RpcError::not_registered(&id));
        }

        let (tx, rx) = oneshot::channel();
        self.calls
            .send(Call {
                command,
                reply: ReplyTo::Sync(tx),
            })
            .await
            .map_err(|_| RpcError::ServerClosed)?;

        rx.await.unwrap_or(Err(RpcError::ServerClosed))
    }

    /// Fire-and-forget call that never waits for queue room.
    pub fn go(&self, command: P::Command) -> Result<(), RpcError> {
        let id = P::id(&command);
        if !self.is_registered(&id) {
            return Err(RpcError::not_registered(&id));
        }

        self.calls
            .try_send(Call {
                command,
                reply: ReplyTo::Nobody,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => RpcError::Busy,
                TrySendError::Closed(_) => RpcError::ServerClosed,
            })
    }

    /// Fire-and-forget call that waits for queue room.
    pub async fn send(&self, command: P::Command) -> Result<(), RpcError> {
        let id = P::id(&command);
        if !self.is_registered(&id) {
            return Err(RpcError::not_registered(&id));
        }

        self.calls
            .send(Call {
                command,
                reply: ReplyTo::Nobody,
            })
            .await
            .map_err(|_| RpcError::ServerClosed)
    }

    /// Fire-and-forget call that never suspends. Failures are only logged.
    pub(crate) fn post(&self, command: P::Command, timeout: Duration) {
        let id = P::id(&command);
        if !self.is_registered(&id) {
            tracing::warn!(?id, "dropping call to unregistered function");
            return;
        }
        self.enqueue(
            Call {
                command,
                reply: ReplyTo::Nobody,
            },
            timeout,
        );
    }

    /// Enqueue without suspending the caller. With a full queue and a
    /// non-zero `timeout`, a helper task waits for room on the caller's
    /// behalf; on failure the reply is rejected with [`RpcError::Busy`].
    pub(crate) fn enqueue(&self, call: Call<P>, timeout: Duration) {
        match self.calls.try_send(call) {
            Ok(()) => {}
            Err(TrySendError::Closed(call)) => call.reply.reject(RpcError::ServerClosed),
            Err(TrySendError::Full(call)) if timeout.is_zero() => {
                tracing::warn!("call rejected, server queue is full");
                call.reply.reject(RpcError::Busy);
            }
            Err(TrySendError::Full(call)) => {
                let calls = self.calls.clone();
                tokio::spawn(async move {
                    match calls.send_timeout(call, timeout).await {
                        Ok(()) => {}
                        Err(SendTimeoutError::Timeout(call)) => {
                            tracing::warn!(?timeout, "call rejected, server queue stayed full");
                            call.reply.reject(RpcError::Busy);
                        }
                        Err(SendTimeoutError::Closed(call)) => {
                            call.reply.reject(RpcError::ServerClosed)
                        }
                    }
                });
            }
        }
    }
}

/// Synchronous call through `server`.
pub async fn call<P: Protocol>(
    server: &ServerHandle<P>,
    command: P::Command,
) -> Result<P::Reply, RpcError> {
    server.call(command).await
}
