//! Panic recovery used at every execution boundary (handlers, callbacks,
//! deferred work, timers, teardown).

use module_kit_protocol::RpcError;
use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default byte budget for stack traces attached to recovered panics.
pub const DEFAULT_STACK_BUF_LEN: usize = 4096;

static STACK_BUF_LEN: AtomicUsize = AtomicUsize::new(DEFAULT_STACK_BUF_LEN);

/// Set the byte budget for captured stack traces. Zero disables capture.
pub fn set_stack_buf_len(len: usize) {
    STACK_BUF_LEN.store(len, Ordering::Relaxed);
}

/// Current byte budget for captured stack traces.
pub fn stack_buf_len() -> usize {
    STACK_BUF_LEN.load(Ordering::Relaxed)
}

/// A panic caught at an execution boundary.
#[derive(Debug, Clone)]
pub struct Fault {
    pub message: String,
    pub stack: Option<String>,
}

impl Fault {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };

        Self {
            message,
            stack: capture_stack(stack_buf_len()),
        }
    }

    /// Log the fault with the boundary it was caught at.
    pub fn log(&self, context: &str) {
        match &self.stack {
            Some(stack) => tracing::error!("{}: {}: {}", context, self.message, stack),
            None => tracing::error!("{}: {}", context, self.message),
        }
    }

    pub fn into_rpc_error(self) -> RpcError {
        RpcError::Panic {
            message: self.message,
            stack: self.stack,
        }
    }
}

/// Run `f`, turning a panic into a `Fault`.
pub fn recover<T>(f: impl FnOnce() -> T) -> Result<T, Fault> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(Fault::from_payload)
}

/// Run `f`, logging a panic instead of propagating it.
pub fn recover_and_log(context: &str, f: impl FnOnce()) {
    if let Err(fault) = recover(f) {
        fault.log(context);
    }
}

fn capture_stack(budget: usize) -> Option<String> {
    if budget == 0 {
        return None;
    }

    let mut trace = Backtrace::force_capture().to_string();
    if trace.len() > budget {
        let mut end = budget;
        while !trace.is_char_boundary(end) {
            end -= 1;
        }
        trace.truncate(end);
    }
    Some(trace)
}
