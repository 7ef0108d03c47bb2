use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

/// Trait that module authors implement to describe what a module's RPC
/// server accepts.
///
/// `Command` is a closed enum of everything the module handles, `Id` names a
/// variant (the key handlers are registered under) and `Reply` is what a
/// handler hands back to the caller.
pub trait Protocol: Send + Sync + 'static {
    type Id: Eq + Hash + Clone + Send + Sync + 'static + fmt::Debug;
    type Command: Send + 'static;
    type Reply: Send + 'static;

    /// Which handler a command is routed to.
    fn id(command: &Self::Command) -> Self::Id;
}

/// Error delivered to a caller through the RPC return path.
///
/// None of these are fatal: wiring mistakes (duplicate handlers, dispatch to
/// a handler that was never registered) panic at setup instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("function id {0}: function not registered")]
    NotRegistered(String),

    #[error("too many calls of client")]
    TooManyCalls,

    #[error("server is too busy")]
    Busy,

    #[error("server closed")]
    ServerClosed,

    /// The handler panicked. `stack` is only captured when a stack budget is
    /// configured and is never part of the display text.
    #[error("{message}")]
    Panic {
        message: String,
        stack: Option<String>,
    },

    /// Error returned by the handler itself.
    #[error("{0}")]
    Handler(String),
}

impl RpcError {
    /// Error for an id that has no handler on the target server.
    pub fn not_registered(id: &impl fmt::Debug) -> Self {
        RpcError::NotRegistered(format!("{:?}", id))
    }

    /// Error raised by handler logic.
    pub fn handler(message: impl Into<String>) -> Self {
        RpcError::Handler(message.into())
    }

    /// Returns true if the handler panicked.
    pub fn is_panic(&self) -> bool {
        matches!(self, RpcError::Panic { .. })
    }
}

/// Console command: a named debug command with its textual arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleCommand {
    pub name: String,
    pub args: Vec<String>,
}

impl ConsoleCommand {
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Split a console line into command name and arguments.
    /// Returns `None` for a blank line.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let name = parts.next()?;
        Some(Self::new(name, parts.map(str::to_string).collect()))
    }
}

/// Protocol of the per-module command server. Commands are routed by name and
/// answer with text.
pub struct Console;

impl Protocol for Console {
    type Id = String;
    type Command = ConsoleCommand;
    type Reply = String;

    fn id(command: &ConsoleCommand) -> String {
        command.name.clone()
    }
}
