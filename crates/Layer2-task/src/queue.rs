//! Job Queue - FIFO admission with a concurrency ceiling
//!
//! Submissions are accepted immediately into an unbounded pending list and
//! only throttled at dispatch time. A worker must hold one of
//! `max_concurrent` semaphore permits before it may take a job; the permit
//! travels with the [`Dispatch`] and is released when the dispatch is dropped
//! at the end of execution. Pending jobs leave the queue strictly in
//! submission order.

use crate::job::Job;
use crate::registry::{TaskRegistry, TaskUpdate};
use mediaforge_foundation::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A job handed to a worker, holding one concurrency slot until dropped
#[derive(Debug)]
pub struct Dispatch {
    pub job: Job,
    _permit: OwnedSemaphorePermit,
    running: Arc<AtomicUsize>,
}

impl Drop for Dispatch {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded-concurrency dispatch queue
pub struct JobQueue {
    pending: Mutex<VecDeque<Job>>,
    available: Notify,
    permits: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
    max_concurrent: usize,
    closed: AtomicBool,
    registry: Arc<TaskRegistry>,
}

impl JobQueue {
    pub fn new(max_concurrent: usize, registry: Arc<TaskRegistry>) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            pending: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            running: Arc::new(AtomicUsize::new(0)),
            max_concurrent,
            closed: AtomicBool::new(false),
            registry,
        }
    }

    /// Append a job; returns its 1-based position in the pending list
    pub fn push(&self, job: Job) -> Result<usize> {
        self.push_with(job, |_| {})
    }

    /// Append a job, running `on_queued` with its position first
    ///
    /// The queued message and `on_queued` both happen before any worker can
    /// see the job, so they never land after its `Running` update.
    pub fn push_with(&self, job: Job, on_queued: impl FnOnce(usize)) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Cancelled("job queue is shut down".to_string()));
        }

        let task_id = job.task_id;
        let position = {
            let mut pending = self.pending.lock();
            let position = pending.len() + 1;
            self.registry.update(
                task_id,
                TaskUpdate::new().message(format!("Queued (position {})", position)),
            );
            on_queued(position);
            pending.push_back(job);
            position
        };

        debug!(task_id = %task_id.short(), position, "Job queued");

        self.available.notify_one();
        Ok(position)
    }

    /// Wait for a free slot, then for the head of the pending list
    ///
    /// Returns `None` once `cancel` fires or the queue is closed and empty.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<Dispatch> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok()?,
        };

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.pending.lock().pop_front() {
                self.running.fetch_add(1, Ordering::SeqCst);
                return Some(Dispatch {
                    job,
                    _permit: permit,
                    running: Arc::clone(&self.running),
                });
            }

            if self.is_closed() {
                return None;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    /// Stop accepting jobs and wake idle workers
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remove and return every job not yet dispatched
    pub fn drain(&self) -> Vec<Job> {
        self.pending.lock().drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Jobs currently handed to workers
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}
