use crate::recover;
use futures::future::BoxFuture;
use module_kit_protocol::{Protocol, RpcError};
use std::time::Duration;
use tokio::sync::oneshot;

/// Callback of an asynchronous call, run on the caller's loop.
pub type AsyncCallback<S, R> = Box<dyn FnOnce(&mut S, Result<R, RpcError>) + Send>;

/// A call waiting in a server's queue.
pub struct Call<P: Protocol> {
    pub(crate) command: P::Command,
    pub(crate) reply: ReplyTo<P::Reply>,
}

impl<P: Protocol> Call<P> {
    pub fn id(&self) -> P::Id {
        P::id(&self.command)
    }
}

/// Where the outcome of a call goes. Exactly one delivery happens per call.
pub(crate) enum ReplyTo<R> {
    /// Fire-and-forget.
    Nobody,
    Sync(oneshot::Sender<Result<R, RpcError>>),
    Async(Box<dyn AsyncReply<R>>),
}

/// Outcome of handing a reply back to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    /// The caller's return queue stayed full past the return timeout.
    Dropped,
    /// The caller's loop is gone.
    CallerGone,
}

/// Return path of an asynchronous call back into the caller's loop.
pub(crate) trait AsyncReply<R>: Send {
    /// Deliver the server's outcome, waiting at most `timeout` for room in
    /// the caller's return queue.
    fn deliver(
        self: Box<Self>,
        result: Result<R, RpcError>,
        timeout: Duration,
    ) -> BoxFuture<'static, Delivery>;

    /// Deliver a failure synthesized before the server ever ran the call.
    fn reject(self: Box<Self>, error: RpcError);
}

impl<R> ReplyTo<R> {
    pub(crate) async fn deliver(
        self,
        result: Result<R, RpcError>,
        timeout: Duration,
    ) -> Delivery {
        match self {
            ReplyTo::Nobody => {
                if let Err(e) = result {
                    tracing::debug!("fire-and-forget call failed: {}", e);
                }
                Delivery::Delivered
            }
            ReplyTo::Sync(tx) => match tx.send(result) {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::CallerGone,
            },
            ReplyTo::Async(reply) => reply.deliver(result, timeout).await,
        }
    }

    pub(crate) fn reject(self, error: RpcError) {
        match self {
            ReplyTo::Nobody => tracing::warn!("fire-and-forget call dropped: {}", error),
            ReplyTo::Sync(tx) => {
                let _ = tx.send(Err(error));
            }
            ReplyTo::Async(reply) => reply.reject(error),
        }
    }
}

/// A finished asynchronous call, queued for its callback to run on the
/// caller's loop.
pub struct Return<S> {
    callback: Box<dyn FnOnce(&mut S) + Send>,
    holds_slot: bool,
}

impl<S: 'static> Return<S> {
    pub(crate) fn new<R: Send + 'static>(
        callback: AsyncCallback<S, R>,
        result: Result<R, RpcError>,
        holds_slot: bool,
    ) -> Self {
        Self {
            callback: Box::new(move |state: &mut S| callback(state, result)),
            holds_slot,
        }
    }

    /// Whether this return releases a slot of the caller's pending count.
    /// Calls rejected before being counted do not.
    pub fn holds_slot(&self) -> bool {
        self.holds_slot
    }

    /// Run the callback. A panic is logged and swallowed.
    pub fn invoke(self, state: &mut S) {
        let callback = self.callback;
        recover::recover_and_log("async call callback", || callback(state));
    }
}
