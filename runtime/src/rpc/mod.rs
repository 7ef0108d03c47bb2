//! Channel RPC: a server owns a handler table and a bounded call queue, and
//! callers reach it through cloneable handles.
//!
//! - `ServerHandle::call` waits for the reply.
//! - `Client::async_call` never waits; the reply comes back as a `Return`
//!   that the caller's own loop runs.
//! - `ServerHandle::go` / `send` are fire-and-forget.

mod call;
mod client;
mod server;


pub use call::{AsyncCallback, Call, Return};
pub use client::{Client, ReturnQueue};
pub use server::{call, Handler, Server, ServerHandle};
