//! Deferred work: blocking work runs on tokio's blocking pool and its
//! completion callback is queued back to the owning loop.

mod executor;
mod linear;

#[cfg(test)]
mod tests;

pub use executor::{Completion, CompletionQueue, Executor};
pub use linear::LinearContext;
