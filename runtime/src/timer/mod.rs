//! Timers whose callbacks run on the owning loop: one-shot `after_func`
//! timers and recurring cron timers.

mod cron;
mod dispatcher;

#[cfg(test)]
mod tests;

pub use cron::{CronError, CronExpr};
pub use dispatcher::{Cron, Dispatcher, Timer, TimerQueue};
