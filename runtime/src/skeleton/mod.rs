//! The per-module actor: one loop owns the module and serializes everything
//! that touches it.
//!
//! A module embeds a [`Skeleton`], registers its handlers in
//! [`Module::on_init`] (called through [`init`]), and is driven by [`run`]
//! (usually via the [`Registry`](crate::registry::Registry)).

mod actor;
mod types;

#[cfg(test)]
mod tests;

pub use actor::{init, run, Module};
pub use types::{CommandOf, Skeleton, SkeletonState};
