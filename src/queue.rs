//! Serialised dispatch of provider calls.
//!
//! One worker task drains a FIFO channel. Producers get the task's output
//! back through a oneshot; at most one task runs at any instant and the
//! worker pauses for `gap` after each one.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("request queue is closed")]
    Closed,

    #[error("queued request was dropped before completing")]
    Dropped,
}

#[derive(Debug, Clone)]
pub struct RequestQueue {
    sender: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
}

impl RequestQueue {
    /// Starts the worker on the current tokio runtime.
    pub fn spawn(gap: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        tokio::spawn(drain(receiver, pending.clone(), gap));
        Self { sender, pending }
    }

    /// Number of tasks waiting to start.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Queues `task` immediately. The returned future only waits for the
    /// result; dropping it does not cancel the task.
    pub fn enqueue<T, F, Fut>(&self, task: F) -> impl Future<Output = Result<T, QueueError>>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::new(move || -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(async move {
                let output = task().await;
                // The caller may have stopped waiting.
                let _ = done_tx.send(output);
            })
        });

        self.pending.fetch_add(1, Ordering::SeqCst);
        let sent = self.sender.send(job).is_ok();
        if !sent {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            log::error!("[queue] Worker is gone, rejecting request");
        }

        async move {
            if !sent {
                return Err(QueueError::Closed);
            }
            done_rx.await.map_err(|_| QueueError::Dropped)
        }
    }
}

async fn drain(mut receiver: mpsc::UnboundedReceiver<Job>, pending: Arc<AtomicUsize>, gap: Duration) {
    while let Some(job) = receiver.recv().await {
        pending.fetch_sub(1, Ordering::SeqCst);
        // Run on its own task so a panic is contained.
        if let Err(error) = tokio::spawn(job()).await {
            log::error!("[queue] Request processing error: {}", error);
        }
        tokio::time::sleep(gap).await;
    }
    log::debug!("[queue] All producers dropped, worker exiting");
}
