use super::linear::LinearContext;
use crate::recover;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Callback that runs on the owning loop once its work is done.
pub type Completion<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Runs blocking work off the owning loop and queues its completion back.
pub struct Executor<S> {
    completions: mpsc::Sender<Completion<S>>,
    pending: Arc<AtomicUsize>,
}

impl<S> Clone for Executor<S> {
    fn clone(&self) -> Self {
        Self {
            completions: self.completions.clone(),
            pending: self.pending.clone(),
        }
    }
}

/// Loop side of an [`Executor`].
pub struct CompletionQueue<S> {
    completions: mpsc::Receiver<Completion<S>>,
    pending: Arc<AtomicUsize>,
}

impl<S: 'static> Executor<S> {
    /// `queue_len` is clamped to at least 1.
    pub fn new(queue_len: usize) -> (Self, CompletionQueue<S>) {
        let (tx, rx) = mpsc::channel(queue_len.max(1));
        let pending = Arc::new(AtomicUsize::new(0));
        (
            Self {
                completions: tx,
                pending: pending.clone(),
            },
            CompletionQueue {
                completions: rx,
                pending,
            },
        )
    }

    /// Run `work` on the blocking pool, then queue `completion`. A panic in
    /// `work` is logged and the completion still runs.
    pub fn go<W, C>(&self, work: W, completion: C)
    where
        W: FnOnce() + Send + 'static,
        C: FnOnce(&mut S) + Send + 'static,
    {
        let completions = self.begin();
        tokio::task::spawn_blocking(move || {
            recover::recover_and_log("deferred work", work);
            if completions.blocking_send(Box::new(completion)).is_err() {
                tracing::warn!("deferred work finished after its loop closed");
            }
        });
    }

    /// A context whose work items run one at a time in submission order.
    pub fn linear_context(&self) -> LinearContext<S> {
        LinearContext::new(self.clone())
    }

    /// Tasks submitted whose completion has not run yet.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn idle(&self) -> bool {
        self.pending() == 0
    }

    pub(crate) fn begin(&self) -> mpsc::Sender<Completion<S>> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.completions.clone()
    }
}

impl<S> CompletionQueue<S> {
    pub async fn recv(&mut self) -> Option<Completion<S>> {
        self.completions.recv().await
    }

    /// Run a completion on the owning loop.
    pub fn run(&self, completion: Completion<S>, state: &mut S) {
        recover::recover_and_log("task completion", || completion(state));
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait for every outstanding task and run its completion.
    pub async fn close(&mut self, state: &mut S) {
        while self.pending() > 0 {
            match self.completions.recv().await {
                Some(completion) => self.run(completion, state),
                None => break,
            }
        }
        self.completions.close();
    }
}
