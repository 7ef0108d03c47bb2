use super::executor::{Completion, Executor};
use crate::recover;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

struct LinearTask<S> {
    work: Box<dyn FnOnce() + Send>,
    completion: Completion<S>,
    completions: mpsc::Sender<Completion<S>>,
}

struct Backlog<S> {
    queue: VecDeque<LinearTask<S>>,
    /// A worker is draining `queue`.
    running: bool,
}

/// Serializes work items: each runs only after the previous one finished,
/// in submission order. Completions go through the parent executor.
///
/// A context occupies at most one blocking-pool thread at a time.
pub struct LinearContext<S> {
    executor: Executor<S>,
    backlog: Arc<Mutex<Backlog<S>>>,
}

impl<S> Clone for LinearContext<S> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            backlog: self.backlog.clone(),
        }
    }
}

impl<S: 'static> LinearContext<S> {
    pub(crate) fn new(executor: Executor<S>) -> Self {
        Self {
            executor,
            backlog: Arc::new(Mutex::new(Backlog {
                queue: VecDeque::new(),
                running: false,
            })),
        }
    }

    pub fn go<W, C>(&self, work: W, completion: C)
    where
        W: FnOnce() + Send + 'static,
        C: FnOnce(&mut S) + Send + 'static,
    {
        let task = LinearTask {
            work: Box::new(work),
            completion: Box::new(completion),
            completions: self.executor.begin(),
        };

        let spawn_worker = {
            let mut backlog = self.backlog.lock();
            backlog.queue.push_back(task);
            !std::mem::replace(&mut backlog.running, true)
        };

        if spawn_worker {
            let backlog = self.backlog.clone();
            tokio::task::spawn_blocking(move || drain(&backlog));
        }
    }

    /// Items submitted but not yet started.
    pub fn queued(&self) -> usize {
        self.backlog.lock().queue.len()
    }
}

fn drain<S>(backlog: &Mutex<Backlog<S>>) {
    loop {
        let next = {
            let mut backlog = backlog.lock();
            match backlog.queue.pop_front() {
                Some(task) => task,
                None => {
                    backlog.running = false;
                    return;
                }
            }
        };

        recover::recover_and_log("linear work", next.work);
        if next.completions.blocking_send(next.completion).is_err() {
            tracing::warn!("linear work finished after its loop closed");
        }
    }
}
