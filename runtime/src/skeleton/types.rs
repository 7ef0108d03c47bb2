use super::actor::Module;
use crate::config::{ModuleConfig, ModuleSettings};
use crate::rpc::{Client, ReturnQueue, Server, ServerHandle};
use crate::task::{CompletionQueue, Executor, LinearContext};
use crate::timer::{Cron, CronExpr, Dispatcher, Timer, TimerQueue};
use module_kit_protocol::{Console, ConsoleCommand, Protocol, RpcError};
use std::future::Future;
use std::time::Duration;

/// Lifecycle of a module's loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkeletonState {
    /// Queues sized, handlers may be registered.
    Constructed,
    /// `on_init` ran.
    Initialized,
    Running,
    /// Close signal observed, queues being drained.
    Closing,
    /// Loop returned.
    Closed,
    /// `on_destroy` ran.
    Destroyed,
}

/// Shorthand for the command type of a module's own protocol.
pub type CommandOf<M> = <<M as Module>::Protocol as Protocol>::Command;

/// Receivers the loop drains. Taken out of the skeleton when the loop starts.
pub(crate) struct Inbox<M: Module> {
    pub(super) server: Server<M, M::Protocol>,
    pub(super) commands: Server<M, Console>,
    pub(super) returns: ReturnQueue<M>,
    pub(super) completions: CompletionQueue<M>,
    pub(super) timers: TimerQueue<M>,
}

/// Per-module actor machinery: an RPC server for the module's protocol, a
/// console command server, an async RPC client, a task executor and a timer
/// dispatcher, all drained by one loop (see [`run`](super::run)).
///
/// Everything a handler can do to other modules goes through here.
pub struct Skeleton<M: Module> {
    settings: ModuleSettings,
    state: SkeletonState,
    server: ServerHandle<M::Protocol>,
    commands: ServerHandle<Console>,
    command_help: Vec<(String, String)>,
    client: Client<M>,
    executor: Executor<M>,
    dispatcher: Dispatcher<M>,
    inbox: Option<Inbox<M>>,
}

impl<M: Module> Skeleton<M> {
    pub fn new(config: &ModuleConfig) -> Self {
        let settings = config.init();

        let server = Server::new(settings.rpc_queue_len, settings.rpc_return_timeout);
        let commands = Server::new(settings.rpc_queue_len, settings.rpc_return_timeout);
        let (client, returns) =
            Client::new(settings.async_return_queue_len, settings.async_call_timeout);
        let (executor, completions) = Executor::new(settings.task_queue_len);
        let (dispatcher, timers) = Dispatcher::new(settings.timer_queue_len);

        Self {
            settings,
            state: SkeletonState::Constructed,
            server: server.handle(),
            commands: commands.handle(),
            command_help: Vec::new(),
            client,
            executor,
            dispatcher,
            inbox: Some(Inbox {
                server,
                commands,
                returns,
                completions,
                timers,
            }),
        }
    }

    pub fn state(&self) -> SkeletonState {
        self.state
    }

    pub fn settings(&self) -> &ModuleSettings {
        &self.settings
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a handler on the module's own server.
    ///
    /// # Panics
    /// On a duplicate id, or once the loop has started.
    pub fn register<F>(&mut self, id: <M::Protocol as Protocol>::Id, handler: F)
    where
        F: Fn(&mut M, CommandOf<M>) -> Result<<M::Protocol as Protocol>::Reply, RpcError>
            + Send
            + 'static,
    {
        self.inbox_mut().server.register(id, handler);
    }

    /// Register a handler that receives only the payload of its command
    /// variant. `extract` pulls the payload out (see [`variant!`](crate::variant));
    /// a command it rejects fails the call with [`RpcError::Handler`].
    ///
    /// # Panics
    /// Same as [`register`](Self::register).
    pub fn register_variant<T, X, F>(
        &mut self,
        id: <M::Protocol as Protocol>::Id,
        extract: X,
        handler: F,
    ) where
        X: Fn(CommandOf<M>) -> Option<T> + Send + 'static,
        F: Fn(&mut M, T) -> Result<<M::Protocol as Protocol>::Reply, RpcError> + Send + 'static,
    {
        let label = format!("{:?}", id);
        self.register(id, move |module: &mut M, command| match extract(command) {
            Some(payload) => handler(module, payload),
            None => Err(RpcError::handler(format!(
                "function id {}: command of another variant",
                label
            ))),
        });
    }

    /// Register a console command.
    ///
    /// # Panics
    /// On a duplicate name, or once the loop has started.
    pub fn register_command<F>(&mut self, name: &str, help: &str, handler: F)
    where
        F: Fn(&mut M, &[String]) -> Result<String, RpcError> + Send + 'static,
    {
        self.inbox_mut()
            .commands
            .register(name.to_string(), move |module: &mut M, cmd: ConsoleCommand| {
                handler(module, &cmd.args)
            });
        self.command_help.push((name.to_string(), help.to_string()));
    }

    fn inbox_mut(&mut self) -> &mut Inbox<M> {
        match self.inbox.as_mut() {
            Some(inbox) => inbox,
            None => panic!("cannot register handlers after the module loop started"),
        }
    }

    // ========================================================================
    // RPC
    // ========================================================================

    /// Handle of this module's own server.
    pub fn server(&self) -> ServerHandle<M::Protocol> {
        self.server.clone()
    }

    /// Handle of this module's console command server.
    pub fn commands(&self) -> ServerHandle<Console> {
        self.commands.clone()
    }

    /// `(name, help)` of every console command, in registration order.
    pub fn command_help(&self) -> &[(String, String)] {
        &self.command_help
    }

    /// Queue a call to this module's own server, ignoring the outcome.
    pub fn go_rpc(&self, command: CommandOf<M>) {
        self.server.post(command, self.settings.async_call_timeout);
    }

    /// Asynchronous call to any server. `callback` runs on this module's loop.
    pub fn async_call<P, F>(&mut self, server: &ServerHandle<P>, command: P::Command, callback: F)
    where
        P: Protocol,
        F: FnOnce(&mut M, Result<P::Reply, RpcError>) + Send + 'static,
    {
        self.client.async_call(server, command, callback);
    }

    /// Synchronous call to any server. The returned future owns everything it
    /// needs, so a handler can spawn it.
    pub fn syn_call<P: Protocol>(
        &self,
        server: &ServerHandle<P>,
        command: P::Command,
    ) -> impl Future<Output = Result<P::Reply, RpcError>> + Send + 'static {
        let server = server.clone();
        async move { server.call(command).await }
    }

    pub fn allow_overflow(&mut self, allow: bool) {
        self.client.allow_overflow(allow);
    }

    /// Async calls whose callback has not run yet.
    pub fn pending_async_calls(&self) -> usize {
        self.client.pending()
    }

    // ========================================================================
    // Tasks and timers
    // ========================================================================

    pub fn go<W, C>(&self, work: W, completion: C)
    where
        W: FnOnce() + Send + 'static,
        C: FnOnce(&mut M) + Send + 'static,
    {
        self.executor.go(work, completion);
    }

    pub fn linear_context(&self) -> LinearContext<M> {
        self.executor.linear_context()
    }

    pub fn executor_idle(&self) -> bool {
        self.executor.idle()
    }

    pub fn after_func<F>(&self, delay: Duration, callback: F) -> Timer<M>
    where
        F: FnOnce(&mut M) + Send + 'static,
    {
        self.dispatcher.after_func(delay, callback)
    }

    pub fn cron_func<F>(&self, expr: CronExpr, callback: F) -> Cron<M>
    where
        F: Fn(&mut M) + Send + Sync + 'static,
    {
        self.dispatcher.cron_func(expr, callback)
    }

    // ========================================================================
    // Loop plumbing
    // ========================================================================

    pub(super) fn start(&mut self) -> Option<Inbox<M>> {
        let inbox = self.inbox.take()?;
        self.state = SkeletonState::Running;
        Some(inbox)
    }

    pub(crate) fn set_state(&mut self, state: SkeletonState) {
        self.state = state;
    }

    pub(super) fn client_mut(&mut self) -> &mut Client<M> {
        &mut self.client
    }
}
