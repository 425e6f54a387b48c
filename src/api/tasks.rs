//! Supervised fire-and-forget background work.
//!
//! Handlers hand work to the supervisor instead of spawning naked tasks. The
//! supervisor counts the unit as outstanding *before* the task starts, so a
//! concurrent drain can never race ahead and observe zero while a spawn is
//! still in flight. A panic inside the work is caught at the task boundary,
//! logged as a failure record, and never takes down the process or any other
//! task.

use std::{
    future::Future,
    pin::pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::Notify;
use tracing::error;

#[derive(Clone, Debug, Default)]
pub struct TaskSupervisor {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    outstanding: AtomicUsize,
    idle: Notify,
}

impl TaskSupervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `work` on its own task. Success or recovered failure, the
    /// outstanding count is decremented exactly once when it finishes.
    pub fn spawn<F>(&self, name: &'static str, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(work);
        tokio::spawn(async move {
            // A panicked task surfaces here as a JoinError; it is terminal
            // for this unit of work only
            if let Err(err) = handle.await {
                if err.is_panic() {
                    error!(task = name, error = %err, "background task panicked");
                } else {
                    error!(task = name, error = %err, "background task aborted");
                }
            }
            if inner.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.idle.notify_waiters();
            }
        });
    }

    /// Number of units currently outstanding.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until the outstanding count reaches zero. No timeout of its own;
    /// callers layer a budget on top if they want one.
    pub async fn drain(&self) {
        loop {
            let mut idle = pin!(self.inner.idle.notified());
            // Register interest before the count check so a completion
            // between check and await cannot be missed
            idle.as_mut().enable();
            if self.inner.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}
