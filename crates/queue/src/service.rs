//! Caller-facing facade over the queue core.
//!
//! [`GenerationService::start`] wires a [`JobQueue`], a
//! [`CancellationController`], an [`EventBus`] and a [`HealthMonitor`]
//! together and spawns the single [`Worker`] task. The returned handle is
//! cheap to clone into any number of request sources.

use std::sync::Arc;

use chrono::Utc;
use switchgen_core::backend::ExecutionBackend;
use switchgen_core::job::{GenerationRequest, Job};
use switchgen_core::types::JobId;
use switchgen_events::{EventBus, QueueEvent};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cancel::CancellationController;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::health::{HealthMonitor, HealthReport};
use crate::queue::JobQueue;
use crate::worker::Worker;

/// Shared handle to a running queue.
#[derive(Clone)]
pub struct GenerationService {
    queue: Arc<JobQueue>,
    cancel: Arc<CancellationController>,
    events: Arc<EventBus>,
    health: Arc<HealthMonitor>,
}

impl GenerationService {
    /// Validate `config`, build the core and spawn the worker task.
    ///
    /// The join handle resolves once [`shutdown`](Self::shutdown) has been
    /// called and the in-flight job (if any) has been reclaimed.
    pub fn start(
        backend: Arc<dyn ExecutionBackend>,
        config: QueueConfig,
    ) -> Result<(Self, JoinHandle<()>), QueueError> {
        config.validate()?;

        let service = Self {
            queue: Arc::new(JobQueue::new()),
            cancel: Arc::new(CancellationController::new()),
            events: Arc::new(EventBus::new(config.event_capacity)),
            health: Arc::new(HealthMonitor::new()),
        };

        let worker = Worker::new(
            Arc::clone(&service.queue),
            backend,
            Arc::clone(&service.cancel),
            Arc::clone(&service.events),
            Arc::clone(&service.health),
            &config,
        )?;
        let handle = tokio::spawn(worker.run());

        Ok((service, handle))
    }

    /// Admit a fully resolved request. Never blocks on the worker.
    pub fn submit(&self, request: GenerationRequest) -> Result<JobId, QueueError> {
        let job_id = self.queue.enqueue(request)?;
        tracing::info!(job_id = %job_id, pending = self.queue.pending_len(), "Job submitted");
        self.events.publish(QueueEvent::JobSubmitted {
            job_id,
            at: Utc::now(),
        });
        Ok(job_id)
    }

    /// Cancel a job wherever it is.
    ///
    /// A pending job is cancelled immediately. A running job is asked to
    /// stop and settles asynchronously. Returns `false` if the job is
    /// unknown or already terminal.
    pub fn cancel(&self, job_id: JobId) -> bool {
        if self.queue.cancel_pending(job_id) {
            self.events.publish(QueueEvent::JobCancelled {
                job_id,
                forced: false,
                at: Utc::now(),
            });
            return true;
        }
        self.cancel.request_cancel(job_id)
    }

    /// Cancel whatever is running right now, if anything.
    pub fn cancel_current(&self) -> Option<JobId> {
        self.cancel.cancel_current()
    }

    /// Point-in-time snapshot of a job.
    pub fn status(&self, job_id: JobId) -> Option<Job> {
        self.queue.get(job_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn health(&self) -> HealthReport {
        self.health.report()
    }

    /// Wait until `job_id` reaches a terminal state and return its final
    /// snapshot.
    ///
    /// Resolves after the job's post-run reclaim has happened. Fails with
    /// [`QueueError::QueueClosed`] if the queue shuts down while the job is
    /// still waiting to be dequeued.
    pub async fn wait_for(&self, job_id: JobId) -> Result<Job, QueueError> {
        // Subscribe before the first read so no terminal event is missed.
        let mut rx = self.events.subscribe();

        loop {
            match self.queue.get(job_id) {
                None => return Err(QueueError::NotFound(job_id)),
                Some(job) if job.is_terminal() && !self.queue.is_settling(job_id) => {
                    return Ok(job);
                }
                Some(_) if self.queue.is_closed() && self.queue.is_queued(job_id) => {
                    return Err(QueueError::QueueClosed);
                }
                Some(_) => {}
            }

            loop {
                match rx.recv().await {
                    Ok(event) if event.is_terminal() && event.job_id() == Some(job_id) => {
                        return self.queue.get(job_id).ok_or(QueueError::NotFound(job_id));
                    }
                    Ok(QueueEvent::QueueShutdown { .. }) => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(job_id = %job_id, skipped, "Waiter lagged behind the event bus");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(QueueError::QueueClosed);
                    }
                }
            }
        }
    }

    /// Drop the record of a terminal job.
    pub fn evict(&self, job_id: JobId) -> Result<Job, QueueError> {
        self.queue.evict(job_id)
    }

    /// Stop admitting jobs and let the worker exit once idle.
    ///
    /// Pending jobs are left in `Pending` and stay readable. Idempotent.
    pub fn shutdown(&self) {
        if self.queue.shutdown() {
            self.events.publish(QueueEvent::QueueShutdown { at: Utc::now() });
        }
    }

    /// The underlying queue, for inspection.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }
}
