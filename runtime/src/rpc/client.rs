use super::call::{AsyncCallback, AsyncReply, Call, Delivery, ReplyTo, Return};
use super::server::ServerHandle;
use futures::future::BoxFuture;
use module_kit_protocol::{Protocol, RpcError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};

/// Caller side of asynchronous calls.
///
/// Owns the pending count. At most `capacity` calls are outstanding unless
/// overflow is allowed. Results come back through the paired
/// [`ReturnQueue`] and must be handed to [`Client::settle`] before their
/// callback runs.
pub struct Client<S> {
    returns: mpsc::Sender<Return<S>>,
    local: mpsc::UnboundedSender<Return<S>>,
    capacity: usize,
    pending: usize,
    allow_overflow: bool,
    timeout: Duration,
}

/// Receiving half of a [`Client`].
pub struct ReturnQueue<S> {
    returns: mpsc::Receiver<Return<S>>,
    local: mpsc::UnboundedReceiver<Return<S>>,
}

impl<S: 'static> Client<S> {
    /// `capacity` (clamped to at least 1) bounds both the return queue and
    /// the pending count. `timeout` bounds how long a call may wait for room
    /// in a full server queue.
    pub fn new(capacity: usize, timeout: Duration) -> (Self, ReturnQueue<S>) {
        let capacity = capacity.max(1);
        let (returns_tx, returns_rx) = mpsc::channel(capacity);
        let (local_tx, local_rx) = mpsc::unbounded_channel();

        let client = Self {
            returns: returns_tx,
            local: local_tx,
            capacity,
            pending: 0,
            allow_overflow: false,
            timeout,
        };
        let queue = ReturnQueue {
            returns: returns_rx,
            local: local_rx,
        };
        (client, queue)
    }

    /// Let calls beyond `capacity` through. Returns that then find the
    /// queue full are dropped by the server.
    pub fn allow_overflow(&mut self, allow: bool) {
        self.allow_overflow = allow;
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_idle(&self) -> bool {
        self.pending == 0
    }

    /// Asynchronous call. Never suspends: the outcome, success or failure,
    /// always arrives later as a [`Return`] whose callback runs on the loop
    /// that drains the [`ReturnQueue`].
    pub fn async_call<P, F>(&mut self, server: &ServerHandle<P>, command: P::Command, callback: F)
    where
        P: Protocol,
        F: FnOnce(&mut S, Result<P::Reply, RpcError>) + Send + 'static,
    {
        let callback: AsyncCallback<S, P::Reply> = Box::new(callback);

        let id = P::id(&command);
        if !server.is_registered(&id) {
            tracing::debug!(?id, "async call to unregistered function");
            self.push_local(Return::new(callback, Err(RpcError::not_registered(&id)), false));
            return;
        }

        if self.pending >= self.capacity && !self.allow_overflow {
            tracing::warn!(pending = self.pending, "too many calls of client");
            self.push_local(Return::new(callback, Err(RpcError::TooManyCalls), false));
            return;
        }

        self.pending += 1;
        let slot = ReturnSlot {
            returns: self.returns.clone(),
            local: self.local.clone(),
            callback,
        };
        server.enqueue(
            Call {
                command,
                reply: ReplyTo::Async(Box::new(slot)),
            },
            self.timeout,
        );
    }

    /// Account for a return pulled off the [`ReturnQueue`].
    pub fn settle(&mut self, ret: &Return<S>) {
        if ret.holds_slot() {
            self.pending = self.pending.saturating_sub(1);
        }
    }

    /// Settle and run a return.
    pub fn dispatch(&mut self, ret: Return<S>, state: &mut S) {
        self.settle(&ret);
        ret.invoke(state);
    }

    fn push_local(&self, ret: Return<S>) {
        // The receiver lives as long as the owning loop; after that nobody
        // would run the callback anyway.
        let _ = self.local.send(ret);
    }
}

impl<S> ReturnQueue<S> {
    /// Next return. Locally synthesized failures come first.
    pub async fn recv(&mut self) -> Option<Return<S>> {
        tokio::select! {
            biased;
            Some(ret) = self.local.recv() => Some(ret),
            Some(ret) = self.returns.recv() => Some(ret),
            else => None,
        }
    }

    /// Stop accepting returns. Callbacks still queued are dropped unrun.
    pub fn close(&mut self) {
        self.returns.close();
        self.local.close();

        let mut dropped = 0usize;
        while self.local.try_recv().is_ok() {
            dropped += 1;
        }
        while self.returns.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!("return queue closed with {} callbacks unrun", dropped);
        }
    }
}

struct ReturnSlot<S, R> {
    returns: mpsc::Sender<Return<S>>,
    local: mpsc::UnboundedSender<Return<S>>,
    callback: AsyncCallback<S, R>,
}

impl<S: 'static, R: Send + 'static> AsyncReply<R> for ReturnSlot<S, R> {
    fn deliver(
        self: Box<Self>,
        result: Result<R, RpcError>,
        timeout: Duration,
    ) -> BoxFuture<'static, Delivery> {
        let ReturnSlot {
            returns, callback, ..
        } = *self;
        let ret = Return::new(callback, result, true);

        Box::pin(async move {
            if timeout.is_zero() {
                match returns.try_send(ret) {
                    Ok(()) => Delivery::Delivered,
                    Err(TrySendError::Full(_)) => Delivery::Dropped,
                    Err(TrySendError::Closed(_)) => Delivery::CallerGone,
                }
            } else {
                match returns.send_timeout(ret, timeout).await {
                    Ok(()) => Delivery::Delivered,
                    Err(SendTimeoutError::Timeout(_)) => Delivery::Dropped,
                    Err(SendTimeoutError::Closed(_)) => Delivery::CallerGone,
                }
            }
        })
    }

    fn reject(self: Box<Self>, error: RpcError) {
        let ReturnSlot {
            local, callback, ..
        } = *self;
        let _ = local.send(Return::new(callback, Err(error), true));
    }
}
