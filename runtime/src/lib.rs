//! Actor runtime for modular servers.
//!
//! Each [`Module`] owns a [`Skeleton`] and runs on its own loop. Modules talk
//! to each other only through channel RPC: synchronous calls, asynchronous
//! calls whose callbacks run back on the caller's loop, and fire-and-forget
//! sends. The [`Registry`] names, starts and stops them.

pub mod config;
pub mod error;
pub mod logging;
pub mod recover;
pub mod registry;
pub mod rpc;
pub mod skeleton;
pub mod task;
pub mod timer;

pub use config::{ModuleConfig, ModuleSettings, ServerConfig};
pub use error::{ConfigError, RegistryError};
pub use registry::Registry;
pub use rpc::{Client, ReturnQueue, Server, ServerHandle};
pub use skeleton::{CommandOf, Module, Skeleton, SkeletonState};
pub use task::{Executor, LinearContext};
pub use timer::{Cron, CronExpr, Dispatcher, Timer};

pub use module_kit_protocol::{Console, ConsoleCommand, Protocol, RpcError};

/// Payload extractor for [`Skeleton::register_variant`]: matches one
/// command variant and yields the given expression.
///
/// ```ignore
/// skeleton.register_variant(
///     GameId::Say,
///     variant!(GameCmd::Say { agent, text } => (agent, text)),
///     |game: &mut Game, (agent, text)| game.say(agent, text),
/// );
/// ```
#[macro_export]
macro_rules! variant {
    ($pat:pat => $payload:expr) => {
        |command| match command {
            $pat => ::std::option::Option::Some($payload),
            #[allow(unreachable_patterns)]
            _ => ::std::option::Option::None,
        }
    };
}
