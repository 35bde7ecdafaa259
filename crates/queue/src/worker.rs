//! The single job executor.
//!
//! A [`Worker`] drains the [`JobQueue`] serially. For every job it claims
//! it runs the backend, honours cooperative cancellation with a bounded
//! wait, records the terminal state, and then reclaims GPU memory before
//! claiming the next job, whatever the outcome was.
//!
//! ```text
//! Pending --dequeued--> Running --success--> Completed
//!                          |----error-----> Failed
//!                          `--cancel--> Cancelling --stopped / timeout--> Cancelled
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use switchgen_core::backend::{progress_channel, BackendError, ExecutionBackend, ProgressEvent};
use switchgen_core::job::{Job, JobFailure, JobOutput, ProgressInfo};
use switchgen_core::types::JobId;
use switchgen_core::vram::{VramLevel, VramThresholds};
use switchgen_core::warning::HealthWarning;
use switchgen_events::{EventBus, QueueEvent};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cancel::CancellationController;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::health::HealthMonitor;
use crate::queue::{JobOutcome, JobQueue};
use crate::reclaim::ResourceReclaimer;

/// Serial executor bound to one [`JobQueue`].
///
/// Only one worker may be attached to a queue; the single-worker design
/// is what keeps two backend runs from ever overlapping on the GPU.
pub struct Worker {
    queue: Arc<JobQueue>,
    backend: Arc<dyn ExecutionBackend>,
    reclaimer: ResourceReclaimer,
    cancel: Arc<CancellationController>,
    events: Arc<EventBus>,
    health: Arc<HealthMonitor>,
    cancel_timeout: Duration,
    vram: VramThresholds,
}

impl Worker {
    /// Attach a new worker to `queue`.
    ///
    /// Fails with [`QueueError::WorkerAlreadyAttached`] if another worker
    /// holds the role.
    pub fn new(
        queue: Arc<JobQueue>,
        backend: Arc<dyn ExecutionBackend>,
        cancel: Arc<CancellationController>,
        events: Arc<EventBus>,
        health: Arc<HealthMonitor>,
        config: &QueueConfig,
    ) -> Result<Self, QueueError> {
        queue.attach_worker()?;
        Ok(Self {
            reclaimer: ResourceReclaimer::new(Arc::clone(&backend), config.reclaim),
            queue,
            backend,
            cancel,
            events,
            health,
            cancel_timeout: config.cancel_timeout,
            vram: config.vram,
        })
    }

    /// Process jobs until the queue is shut down.
    ///
    /// A job already in flight when shutdown is requested runs to its
    /// terminal state (and is reclaimed) before the loop exits.
    pub async fn run(self) {
        tracing::info!(
            cancel_timeout_ms = self.cancel_timeout.as_millis() as u64,
            reclaim_attempts = self.reclaimer.policy().max_attempts,
            "Worker started",
        );

        while let Some((job, token)) = self.queue.wait_and_claim(&self.cancel).await {
            self.process(job, token).await;
        }

        tracing::info!("Worker stopped");
    }

    /// One full iteration: run, settle, reclaim, publish.
    async fn process(&self, job: Job, token: CancellationToken) {
        let job_id = job.id;

        let finished = match self.queue.mark_running(job_id) {
            Ok(running) => {
                tracing::info!(
                    job_id = %job_id,
                    label = running.request.label.as_deref().unwrap_or(""),
                    "Job started",
                );
                self.events.publish(QueueEvent::JobStarted {
                    job_id,
                    at: Utc::now(),
                });

                let outcome = self.execute(&job, &token).await;
                match self.queue.finish(job_id, outcome) {
                    Ok(done) => Some(done),
                    Err(e) => {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to record job outcome");
                        None
                    }
                }
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Claimed job could not be started");
                None
            }
        };

        self.cancel.disarm(job_id);

        // Paired 1:1 with the dequeue above, whatever happened.
        self.reclaim_after(job_id).await;

        self.queue.mark_settled(job_id);
        if let Some(done) = finished {
            log_terminal(&done);
            if let Some(event) =
                QueueEvent::terminal(job_id, done.status, done.error.as_ref(), done.cancel_forced)
            {
                self.events.publish(event);
            }
        }
        self.health.record_job_processed();
    }

    /// Drive the backend for one job and decide its outcome.
    async fn execute(&self, job: &Job, token: &CancellationToken) -> JobOutcome {
        let job_id = job.id;
        let (progress_tx, mut progress_rx) = progress_channel();
        let run = self.backend.run(&job.request.graph, progress_tx);
        tokio::pin!(run);

        let mut progress = ProgressInfo::default();
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;

                result = &mut run => {
                    while let Ok(event) = progress_rx.try_recv() {
                        self.apply_progress(job_id, &mut progress, &event);
                    }
                    return self.settle(job_id, deadline.is_some(), result);
                }

                Some(event) = progress_rx.recv() => {
                    self.apply_progress(job_id, &mut progress, &event);
                }

                _ = token.cancelled(), if deadline.is_none() => {
                    deadline = Some(Instant::now() + self.cancel_timeout);
                    self.begin_cancel(job_id).await;
                }

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    // Dropping `run` abandons the backend call.
                    let waited_ms = self.cancel_timeout.as_millis() as u64;
                    tracing::warn!(
                        job_id = %job_id,
                        waited_ms,
                        "Backend did not stop in time, forcing cancellation",
                    );
                    let warning = HealthWarning::CancelTimeout { job_id, waited_ms };
                    self.health.record_cancel_timeout(warning.clone());
                    self.events.publish(QueueEvent::health(warning));
                    return JobOutcome::Cancelled { forced: true };
                }
            }
        }
    }

    /// Map the backend's return value to an outcome.
    fn settle(
        &self,
        job_id: JobId,
        cancelling: bool,
        result: Result<JobOutput, BackendError>,
    ) -> JobOutcome {
        if cancelling {
            if let Err(ref e) = result {
                if *e != BackendError::Interrupted {
                    tracing::debug!(job_id = %job_id, error = %e, "Backend stopped with error while cancelling");
                }
            }
            return JobOutcome::Cancelled { forced: false };
        }

        match result {
            Ok(output) => JobOutcome::Completed(output),
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Backend reported an error");
                JobOutcome::Failed(JobFailure::from(&e))
            }
        }
    }

    /// `Running -> Cancelling` and ask the backend to stop.
    async fn begin_cancel(&self, job_id: JobId) {
        match self.queue.mark_cancelling(job_id) {
            Ok(_) => {
                tracing::info!(job_id = %job_id, "Cancelling running job");
                self.events.publish(QueueEvent::JobCancelling {
                    job_id,
                    at: Utc::now(),
                });
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to mark job cancelling");
            }
        }

        match tokio::time::timeout(self.cancel_timeout, self.backend.interrupt()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(job_id = %job_id, error = %e, "Interrupt request failed");
            }
            Err(_) => {
                tracing::warn!(job_id = %job_id, "Interrupt request timed out");
            }
        }
    }

    fn apply_progress(&self, job_id: JobId, progress: &mut ProgressInfo, event: &ProgressEvent) {
        event.apply(progress);
        if let ProgressEvent::Cached { nodes } = event {
            tracing::debug!(job_id = %job_id, cached = nodes.len(), "Nodes served from cache");
            return;
        }
        if let ProgressEvent::NodeCompleted { node } = event {
            tracing::debug!(job_id = %job_id, node = %node, "Node executed");
            return;
        }
        if let Err(e) = self.queue.record_progress(job_id, progress.clone()) {
            tracing::debug!(job_id = %job_id, error = %e, "Dropped progress update");
            return;
        }
        self.events.publish(QueueEvent::JobProgress {
            job_id,
            progress: progress.clone(),
            at: Utc::now(),
        });
    }

    /// Release GPU memory and sample VRAM. Failures are degraded-mode
    /// signals, never fatal.
    async fn reclaim_after(&self, job_id: JobId) {
        let result = self.reclaimer.reclaim().await;

        if result.released {
            self.health.record_reclaim(&result, None);
            self.events.publish(QueueEvent::ReclaimCompleted {
                job_id,
                attempts: result.attempts,
                at: Utc::now(),
            });
        } else {
            tracing::error!(
                job_id = %job_id,
                attempts = result.attempts,
                detail = %result.detail,
                "GPU memory was not released; continuing with reduced memory",
            );
            let warning = HealthWarning::ReclaimFailure {
                job_id,
                attempts: result.attempts,
                detail: result.detail.clone(),
            };
            self.health.record_reclaim(&result, Some(warning.clone()));
            self.events.publish(QueueEvent::health(warning));
        }

        if let Some(usage) = self.backend.vram_usage().await {
            let level = self.vram.evaluate(&usage);
            let warning = (level != VramLevel::Normal).then(|| HealthWarning::VramPressure {
                level,
                used_bytes: usage.used_bytes,
                total_bytes: usage.total_bytes,
            });
            if let Some(ref w) = warning {
                tracing::warn!(job_id = %job_id, warning = %w, "VRAM usage high after reclaim");
                self.events.publish(QueueEvent::health(w.clone()));
            }
            self.health.record_vram(usage, level, warning);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.queue.detach_worker();
    }
}

fn log_terminal(job: &Job) {
    let elapsed_ms = match (job.started_at, job.finished_at) {
        (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
        _ => 0,
    };
    match (&job.error, job.cancel_forced) {
        (Some(error), _) => {
            tracing::warn!(job_id = %job.id, status = %job.status, elapsed_ms, error = %error, "Job finished");
        }
        (None, true) => {
            tracing::warn!(job_id = %job.id, status = %job.status, elapsed_ms, "Job force-cancelled");
        }
        (None, false) => {
            tracing::info!(job_id = %job.id, status = %job.status, elapsed_ms, "Job finished");
        }
    }
}
