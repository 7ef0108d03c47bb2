//! Module trait and the skeleton's main loop.

use super::types::{Skeleton, SkeletonState};
use futures::future::BoxFuture;
use module_kit_protocol::Protocol;
use tokio::sync::oneshot;

/// A unit of the application: owns a [`Skeleton`] and the state its handlers
/// mutate.
pub trait Module: Send + Sized + 'static {
    type Protocol: Protocol;

    fn skeleton(&self) -> &Skeleton<Self>;

    fn skeleton_mut(&mut self) -> &mut Skeleton<Self>;

    /// Called once at registration, before the loop starts. Register handlers
    /// here.
    fn on_init(&mut self);

    /// Called once after the loop returned.
    fn on_destroy(&mut self) {}

    /// Drive the module until `close` fires. Hands the module back for
    /// teardown.
    fn run(self, close: oneshot::Receiver<()>) -> BoxFuture<'static, Self> {
        Box::pin(run(self, close))
    }
}

/// Run `on_init` and mark the module initialized. Call once, before [`run`].
pub fn init<M: Module>(module: &mut M) {
    module.on_init();
    module.skeleton_mut().set_state(SkeletonState::Initialized);
}

/// The skeleton loop.
///
/// Multiplexes the close signal, async returns, calls to the module's own
/// server, console commands, task completions and fired timers. Exactly one
/// of them runs at a time, with `&mut module`.
///
/// On close it shuts down, in order: the command server, the module's
/// server, the executor (running outstanding completions) and the client.
pub async fn run<M: Module>(mut module: M, mut close: oneshot::Receiver<()>) -> M {
    let Some(mut inbox) = module.skeleton_mut().start() else {
        tracing::error!("module loop already started");
        return module;
    };

    loop {
        tokio::select! {
            _ = &mut close => break,
            Some(ret) = inbox.returns.recv() => {
                module.skeleton_mut().client_mut().settle(&ret);
                ret.invoke(&mut module);
            }
            Some(call) = inbox.server.recv() => {
                inbox.server.exec(&mut module, call).await;
            }
            Some(call) = inbox.commands.recv() => {
                inbox.commands.exec(&mut module, call).await;
            }
            Some(completion) = inbox.completions.recv() => {
                inbox.completions.run(completion, &mut module);
            }
            Some(timer) = inbox.timers.recv() => {
                timer.cb(&mut module);
            }
            else => break,
        }
    }

    module.skeleton_mut().set_state(SkeletonState::Closing);

    inbox.commands.close().await;
    inbox.server.close().await;
    inbox.completions.close(&mut module).await;
    inbox.returns.close();
    inbox.timers.close();

    let dropped = inbox.server.dropped_returns() + inbox.commands.dropped_returns();
    if dropped > 0 {
        tracing::debug!(dropped, "module loop closed with dropped returns");
    }

    module.skeleton_mut().set_state(SkeletonState::Closed);
    module
}
