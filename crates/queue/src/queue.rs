//! Ordered, thread-safe holding area for jobs.
//!
//! One mutex guards the pending sequence and the job records. Every read
//! returns a cloned [`Job`], so callers never share mutable state with the
//! worker. A [`Notify`] wakes the worker on enqueue and shutdown.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use switchgen_core::job::{GenerationRequest, Job, JobFailure, JobOutput, ProgressInfo};
use switchgen_core::types::JobId;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::cancel::CancellationController;
use crate::error::QueueError;

/// How a run ended, as decided by the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(JobOutput),
    Failed(JobFailure),
    Cancelled { forced: bool },
}

#[derive(Default)]
struct QueueState {
    /// Ids of `Pending` jobs still eligible for dequeue, in FIFO order.
    pending: VecDeque<JobId>,
    /// Every job record the queue still retains.
    jobs: HashMap<JobId, Job>,
    /// The job currently `Running` or `Cancelling`.
    active: Option<JobId>,
    /// Terminal job whose post-run reclaim has not finished yet.
    settling: Option<JobId>,
    closed: bool,
}

/// FIFO job queue drained by a single worker.
#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    worker_attached: AtomicBool,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- caller operations ----

    /// Append a new `Pending` job. Never blocks.
    pub fn enqueue(&self, request: GenerationRequest) -> Result<JobId, QueueError> {
        let job = Job::new(request);
        let id = job.id;
        {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueError::QueueClosed);
            }
            state.pending.push_back(id);
            state.jobs.insert(id, job);
        }
        self.notify.notify_one();
        tracing::debug!(job_id = %id, "Job enqueued");
        Ok(id)
    }

    /// Remove a still-pending job and mark it `Cancelled`.
    ///
    /// Returns `false` if the job is unknown, already claimed by the
    /// worker, or terminal. The relative order of the remaining pending
    /// jobs is unchanged.
    pub fn cancel_pending(&self, id: JobId) -> bool {
        let mut state = self.lock();
        let Some(pos) = state.pending.iter().position(|p| *p == id) else {
            return false;
        };
        state.pending.remove(pos);
        match state.jobs.get_mut(&id) {
            Some(job) => match job.cancel(false) {
                Ok(()) => {
                    tracing::info!(job_id = %id, "Pending job cancelled");
                    true
                }
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "Pending job in unexpected state");
                    false
                }
            },
            None => false,
        }
    }

    /// Point-in-time copy of a job.
    pub fn get(&self, id: JobId) -> Option<Job> {
        self.lock().jobs.get(&id).cloned()
    }

    /// Stop accepting new jobs and release the worker once it is idle.
    ///
    /// Pending jobs stay retrievable through [`get`](Self::get) but are
    /// never dequeued. Returns `false` if the queue was already closed.
    pub fn shutdown(&self) -> bool {
        let was_open = {
            let mut state = self.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        self.notify.notify_waiters();
        // Also leave a permit in case the worker is between its check and
        // its wait.
        self.notify.notify_one();
        if was_open {
            tracing::info!("Job queue shut down");
        }
        was_open
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Ids of jobs still waiting to be dequeued, in execution order.
    pub fn pending_ids(&self) -> Vec<JobId> {
        self.lock().pending.iter().copied().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether `id` is still waiting in the pending sequence.
    pub fn is_queued(&self, id: JobId) -> bool {
        self.lock().pending.contains(&id)
    }

    /// Snapshot of the job that currently owns the backend.
    pub fn active_job(&self) -> Option<Job> {
        let state = self.lock();
        state.active.and_then(|id| state.jobs.get(&id).cloned())
    }

    /// Drop a terminal job's record. The core imposes no retention
    /// policy; callers evict once they have read the result.
    pub fn evict(&self, id: JobId) -> Result<Job, QueueError> {
        let mut state = self.lock();
        match state.jobs.get(&id) {
            None => Err(QueueError::NotFound(id)),
            Some(job) if !job.is_terminal() => Err(QueueError::NotTerminal(id)),
            Some(_) => state.jobs.remove(&id).ok_or(QueueError::NotFound(id)),
        }
    }

    // ---- worker operations ----

    /// Claim the single worker role.
    pub fn attach_worker(&self) -> Result<(), QueueError> {
        self.worker_attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| QueueError::WorkerAlreadyAttached)
    }

    pub fn detach_worker(&self) {
        self.worker_attached.store(false, Ordering::Release);
    }

    /// Remove and return the head of the pending sequence.
    ///
    /// Returns `None` when nothing is pending or the queue is closed. Only
    /// the attached worker may call this.
    pub fn next_for_worker(&self) -> Option<Job> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        Self::pop_front(&mut state)
    }

    /// Wait until a job is available, claim it and arm `cancel` for it
    /// while still holding the queue lock.
    ///
    /// Arming under the lock closes the window in which a caller could
    /// find the job neither pending nor cancellable. Returns `None` once
    /// the queue is shut down.
    pub async fn wait_and_claim(
        &self,
        cancel: &CancellationController,
    ) -> Option<(Job, CancellationToken)> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(job) = Self::pop_front(&mut state) {
                    let token = cancel.arm(job.id);
                    return Some((job, token));
                }
            }

            notified.await;
        }
    }

    /// `Pending -> Running` for a job previously claimed by the worker.
    pub fn mark_running(&self, id: JobId) -> Result<Job, QueueError> {
        let mut state = self.lock();
        if let Some(active) = state.active {
            return Err(QueueError::Busy { active });
        }
        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        job.start()?;
        let snapshot = job.clone();
        state.active = Some(id);
        Ok(snapshot)
    }

    /// `Running -> Cancelling`.
    pub fn mark_cancelling(&self, id: JobId) -> Result<Job, QueueError> {
        self.update(id, |job| job.begin_cancel())
    }

    /// Overwrite the progress snapshot of the running job.
    pub fn record_progress(&self, id: JobId, progress: ProgressInfo) -> Result<(), QueueError> {
        self.update(id, |job| job.record_progress(progress)).map(|_| ())
    }

    /// Apply the worker's final decision and release the active slot.
    pub fn finish(&self, id: JobId, outcome: JobOutcome) -> Result<Job, QueueError> {
        let mut state = self.lock();
        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        let applied = match outcome {
            JobOutcome::Completed(output) => job.complete(output),
            JobOutcome::Failed(failure) => job.fail(failure),
            JobOutcome::Cancelled { forced } => job.cancel(forced),
        };
        let snapshot = job.clone();
        if state.active == Some(id) {
            state.active = None;
        }
        applied?;
        state.settling = Some(id);
        Ok(snapshot)
    }

    /// Mark the post-run reclaim of `id` as done.
    pub fn mark_settled(&self, id: JobId) {
        let mut state = self.lock();
        if state.settling == Some(id) {
            state.settling = None;
        }
    }

    /// Whether `id` is terminal but the worker is still reclaiming after it.
    pub fn is_settling(&self, id: JobId) -> bool {
        self.lock().settling == Some(id)
    }

    // ---- private helpers ----

    fn update<F>(&self, id: JobId, f: F) -> Result<Job, QueueError>
    where
        F: FnOnce(&mut Job) -> Result<(), switchgen_core::error::CoreError>,
    {
        let mut state = self.lock();
        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        f(job)?;
        Ok(job.clone())
    }

    fn pop_front(state: &mut QueueState) -> Option<Job> {
        let id = state.pending.pop_front()?;
        state.jobs.get(&id).cloned()
    }
}
