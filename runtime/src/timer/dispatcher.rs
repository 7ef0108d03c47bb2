use super::cron::CronExpr;
use crate::recover;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

type TimerFn<S> = Box<dyn FnOnce(&mut S) + Send>;

struct TimerInner<S> {
    callback: Mutex<Option<TimerFn<S>>>,
    sleeper: Mutex<Option<AbortHandle>>,
}

/// A one-shot timer. Its callback runs on the loop draining the matching
/// [`TimerQueue`], at most once.
pub struct Timer<S> {
    inner: Arc<TimerInner<S>>,
}

impl<S> Clone for Timer<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> Timer<S> {
    fn new(callback: TimerFn<S>) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                callback: Mutex::new(Some(callback)),
                sleeper: Mutex::new(None),
            }),
        }
    }

    /// Cancel. A callback that has not run yet never will, even if the timer
    /// already fired into the queue.
    pub fn stop(&self) {
        if let Some(sleeper) = self.inner.sleeper.lock().take() {
            sleeper.abort();
        }
        self.inner.callback.lock().take();
    }

    /// Neither stopped nor run yet.
    pub fn is_active(&self) -> bool {
        self.inner.callback.lock().is_some()
    }

    /// Run the callback if it is still pending. A panic is logged.
    pub fn cb(&self, state: &mut S) {
        let callback = self.inner.callback.lock().take();
        if let Some(callback) = callback {
            recover::recover_and_log("timer callback", || callback(state));
        }
        self.inner.sleeper.lock().take();
    }
}

/// Sleeping timer tasks of one dispatcher, aborted when its queue closes.
#[derive(Default)]
struct Sleepers {
    next_id: u64,
    closed: bool,
    tasks: HashMap<u64, AbortHandle>,
}

impl Sleepers {
    fn abort_all(sleepers: &Mutex<Sleepers>) {
        let tasks: Vec<AbortHandle> = {
            let mut sleepers = sleepers.lock();
            sleepers.closed = true;
            sleepers.tasks.drain().map(|(_, task)| task).collect()
        };
        if !tasks.is_empty() {
            tracing::debug!("aborting {} sleeping timers", tasks.len());
        }
        for task in tasks {
            task.abort();
        }
    }
}

/// Removes a sleeper's entry when its task ends, however it ends.
struct SleeperEntry {
    id: u64,
    sleepers: Arc<Mutex<Sleepers>>,
}

impl Drop for SleeperEntry {
    fn drop(&mut self) {
        self.sleepers.lock().tasks.remove(&self.id);
    }
}

/// Creates timers whose expirations are delivered to one [`TimerQueue`].
pub struct Dispatcher<S> {
    fired: mpsc::Sender<Timer<S>>,
    sleepers: Arc<Mutex<Sleepers>>,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            fired: self.fired.clone(),
            sleepers: self.sleepers.clone(),
        }
    }
}

/// Loop side of a [`Dispatcher`]. Closing or dropping it aborts every timer
/// still sleeping.
pub struct TimerQueue<S> {
    fired: mpsc::Receiver<Timer<S>>,
    sleepers: Arc<Mutex<Sleepers>>,
}

impl<S: 'static> Dispatcher<S> {
    /// `queue_len` is clamped to at least 1.
    pub fn new(queue_len: usize) -> (Self, TimerQueue<S>) {
        let (tx, rx) = mpsc::channel(queue_len.max(1));
        let sleepers = Arc::new(Mutex::new(Sleepers::default()));
        (
            Self {
                fired: tx,
                sleepers: sleepers.clone(),
            },
            TimerQueue {
                fired: rx,
                sleepers,
            },
        )
    }

    /// Fire `callback` once after `delay`. Once the queue has closed the
    /// returned timer is already inactive.
    pub fn after_func<F>(&self, delay: Duration, callback: F) -> Timer<S>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let timer = Timer::new(Box::new(callback));

        let mut sleepers = self.sleepers.lock();
        if sleepers.closed {
            drop(sleepers);
            tracing::debug!("timer created after its loop closed");
            timer.stop();
            return timer;
        }
        let id = sleepers.next_id;
        sleepers.next_id += 1;

        let entry = SleeperEntry {
            id,
            sleepers: self.sleepers.clone(),
        };
        let fired = timer.clone();
        let queue = self.fired.clone();
        let sleeper = tokio::spawn(async move {
            let _entry = entry;
            tokio::time::sleep(delay).await;
            if queue.send(fired).await.is_err() {
                tracing::debug!("timer fired after its loop closed");
            }
        });
        // Inserted before the lock is released, so the entry's drop always
        // finds it.
        sleepers.tasks.insert(id, sleeper.abort_handle());
        drop(sleepers);

        *timer.inner.sleeper.lock() = Some(sleeper.abort_handle());
        timer
    }

    /// Timers currently sleeping.
    pub fn sleeping(&self) -> usize {
        self.sleepers.lock().tasks.len()
    }

    /// Run `callback` at every instant `expr` matches, in local time. The
    /// returned handle is inert when the expression never matches.
    pub fn cron_func<F>(&self, expr: CronExpr, callback: F) -> Cron<S>
    where
        F: Fn(&mut S) + Send + Sync + 'static,
    {
        let now = Local::now();
        let Some(next) = expr.next(&now) else {
            tracing::warn!(%expr, "cron expression never matches");
            return Cron { inner: None };
        };

        let inner = Arc::new(CronInner {
            expr,
            callback: Box::new(callback),
            armed: Mutex::new(None),
            stopped: AtomicBool::new(false),
            dispatcher: self.clone(),
        });
        CronInner::arm(&inner, delay_until(now, next));

        Cron { inner: Some(inner) }
    }
}

impl<S> TimerQueue<S> {
    pub async fn recv(&mut self) -> Option<Timer<S>> {
        self.fired.recv().await
    }

    /// Stop accepting expirations. Sleeping timers are aborted and fired
    /// timers still queued are dropped without running.
    pub fn close(&mut self) {
        Sleepers::abort_all(&self.sleepers);
        self.fired.close();
        while self.fired.try_recv().is_ok() {}
    }
}

impl<S> Drop for TimerQueue<S> {
    fn drop(&mut self) {
        Sleepers::abort_all(&self.sleepers);
    }
}

struct CronInner<S> {
    expr: CronExpr,
    callback: Box<dyn Fn(&mut S) + Send + Sync>,
    armed: Mutex<Option<Timer<S>>>,
    stopped: AtomicBool,
    dispatcher: Dispatcher<S>,
}

impl<S: 'static> CronInner<S> {
    fn arm(this: &Arc<Self>, delay: Duration) {
        let cron = Arc::downgrade(this);
        let timer = this.dispatcher.after_func(delay, move |state| {
            if let Some(cron) = Weak::upgrade(&cron) {
                CronInner::fire(&cron, state);
            }
        });
        *this.armed.lock() = Some(timer);

        // Lost a race with `Cron::stop`.
        if this.stopped.load(Ordering::SeqCst) {
            if let Some(timer) = this.armed.lock().take() {
                timer.stop();
            }
        }
    }

    fn fire(this: &Arc<Self>, state: &mut S) {
        if this.stopped.load(Ordering::SeqCst) {
            return;
        }

        recover::recover_and_log("cron callback", || (this.callback)(state));

        if this.stopped.load(Ordering::SeqCst) {
            return;
        }
        let now = Local::now();
        match this.expr.next(&now) {
            Some(next) => CronInner::arm(this, delay_until(now, next)),
            None => {
                this.armed.lock().take();
            }
        }
    }
}

impl<S> Drop for CronInner<S> {
    fn drop(&mut self) {
        if let Some(timer) = self.armed.get_mut().take() {
            timer.stop();
        }
    }
}

/// A recurring timer driven by a [`CronExpr`]. Dropping the handle stops it.
#[must_use = "dropping a Cron stops it"]
pub struct Cron<S> {
    inner: Option<Arc<CronInner<S>>>,
}

impl<S> Cron<S> {
    /// Cancel all future firings. No-op on an inert handle.
    pub fn stop(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.stopped.store(true, Ordering::SeqCst);
        if let Some(timer) = inner.armed.lock().take() {
            timer.stop();
        }
    }

    /// True when the expression had no future match at creation.
    pub fn is_inert(&self) -> bool {
        self.inner.is_none()
    }

    pub fn is_stopped(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.stopped.load(Ordering::SeqCst),
            None => true,
        }
    }
}

fn delay_until(now: DateTime<Local>, next: DateTime<Local>) -> Duration {
    (next - now).to_std().unwrap_or(Duration::ZERO)
}
