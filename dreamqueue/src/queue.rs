//! The unbounded FIFO work queue shared by producers and the dispatcher.
//!
//! [`WorkQueue`] handles are cheap to clone and can be used from any number of producers. The
//! single [`JobReceiver`] is owned by the dispatcher; it is not [`Clone`], so a job can never be
//! processed by two consumers at once.
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, PoisonError,
};

use fxhash::FxHashMap;
use tokio::sync::mpsc;

use crate::job::{Destination, Job};

/// Creates a connected queue and receiver pair.
pub fn channel() -> (WorkQueue, JobReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let state = Arc::new(QueueState::default());
    (
        WorkQueue {
            sender,
            state: state.clone(),
        },
        JobReceiver { receiver, state },
    )
}

#[derive(Debug, Default)]
struct QueueState {
    len: AtomicUsize,
    pending: Mutex<FxHashMap<Destination, usize>>,
}

impl QueueState {
    fn track(&self, target: &Destination) {
        self.len.fetch_add(1, Ordering::SeqCst);
        *self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(target.clone())
            .or_default() += 1;
    }

    fn untrack(&self, target: &Destination) {
        let _ = self
            .len
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |len| len.checked_sub(1));
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = pending.get_mut(target) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                pending.remove(target);
            }
        }
    }
}

/// The producer side of the queue.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    sender: mpsc::UnboundedSender<Job>,
    state: Arc<QueueState>,
}

impl WorkQueue {
    /// Appends a job to the back of the queue. Never blocks.
    ///
    /// If the dispatcher has already shut down the job is discarded with a warning.
    pub fn push(&self, job: Job) {
        self.state.track(&job.target);
        if let Err(mpsc::error::SendError(job)) = self.sender.send(job) {
            self.state.untrack(&job.target);
            tracing::warn!(job_id = %job.id, "Queue closed, discarding job {}", job.id);
        }
    }

    /// Number of jobs waiting to be processed.
    ///
    /// This is advisory only, e.g. for "position in queue" notices.
    pub fn size(&self) -> usize {
        self.state.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of waiting jobs addressed to `target`. Advisory, like [`WorkQueue::size`].
    pub fn pending_for(&self, target: &Destination) -> usize {
        self.state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .copied()
            .unwrap_or(0)
    }
}

/// The consumer side of the queue.
#[derive(Debug)]
pub struct JobReceiver {
    receiver: mpsc::UnboundedReceiver<Job>,
    state: Arc<QueueState>,
}

impl JobReceiver {
    /// Waits for the next job in arrival order.
    ///
    /// Returns [`None`] once every [`WorkQueue`] handle has been dropped and the queue is empty.
    pub async fn pop(&mut self) -> Option<Job> {
        let job = self.receiver.recv().await?;
        self.state.untrack(&job.target);
        Some(job)
    }

    /// Takes the next job if one is immediately available.
    pub fn try_pop(&mut self) -> Option<Job> {
        let job = self.receiver.try_recv().ok()?;
        self.state.untrack(&job.target);
        Some(job)
    }

    /// Takes every job that is immediately available.
    pub fn drain(&mut self) -> Vec<Job> {
        std::iter::from_fn(|| self.try_pop()).collect()
    }
}
