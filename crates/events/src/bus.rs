//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the subscription channel callers use to follow job
//! lifecycle transitions and progress. It is designed to be shared via
//! `Arc<EventBus>` between the queue facade and the worker task.

use chrono::{DateTime, Utc};
use serde::Serialize;
use switchgen_core::job::{JobFailure, JobStatus, ProgressInfo};
use switchgen_core::job_events::{
    MSG_TYPE_HEALTH_WARNING, MSG_TYPE_JOB_CANCELLED, MSG_TYPE_JOB_CANCELLING,
    MSG_TYPE_JOB_COMPLETED, MSG_TYPE_JOB_FAILED, MSG_TYPE_JOB_PROGRESS, MSG_TYPE_JOB_STARTED,
    MSG_TYPE_JOB_SUBMITTED, MSG_TYPE_QUEUE_SHUTDOWN, MSG_TYPE_RECLAIM_COMPLETED,
};
use switchgen_core::types::JobId;
use switchgen_core::warning::HealthWarning;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// QueueEvent
// ---------------------------------------------------------------------------

/// A notification published by the queue or the worker.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    JobSubmitted {
        job_id: JobId,
        at: DateTime<Utc>,
    },
    JobStarted {
        job_id: JobId,
        at: DateTime<Utc>,
    },
    JobProgress {
        job_id: JobId,
        progress: ProgressInfo,
        at: DateTime<Utc>,
    },
    JobCancelling {
        job_id: JobId,
        at: DateTime<Utc>,
    },
    JobCompleted {
        job_id: JobId,
        at: DateTime<Utc>,
    },
    JobFailed {
        job_id: JobId,
        error: JobFailure,
        at: DateTime<Utc>,
    },
    JobCancelled {
        job_id: JobId,
        /// The backend never acknowledged the interrupt.
        forced: bool,
        at: DateTime<Utc>,
    },
    ReclaimCompleted {
        job_id: JobId,
        attempts: u32,
        at: DateTime<Utc>,
    },
    HealthWarning {
        warning: HealthWarning,
        at: DateTime<Utc>,
    },
    QueueShutdown {
        at: DateTime<Utc>,
    },
}

impl QueueEvent {
    /// Build the terminal event matching a job's final status.
    ///
    /// Returns `None` if the job has not reached a terminal state.
    pub fn terminal(
        job_id: JobId,
        status: JobStatus,
        error: Option<&JobFailure>,
        forced: bool,
    ) -> Option<Self> {
        let at = Utc::now();
        match status {
            JobStatus::Completed => Some(Self::JobCompleted { job_id, at }),
            JobStatus::Failed => Some(Self::JobFailed {
                job_id,
                error: error
                    .cloned()
                    .unwrap_or_else(|| JobFailure::new("unknown backend error")),
                at,
            }),
            JobStatus::Cancelled => Some(Self::JobCancelled { job_id, forced, at }),
            _ => None,
        }
    }

    pub fn health(warning: HealthWarning) -> Self {
        Self::HealthWarning {
            warning,
            at: Utc::now(),
        }
    }

    /// The serialized `type` tag for this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::JobSubmitted { .. } => MSG_TYPE_JOB_SUBMITTED,
            Self::JobStarted { .. } => MSG_TYPE_JOB_STARTED,
            Self::JobProgress { .. } => MSG_TYPE_JOB_PROGRESS,
            Self::JobCancelling { .. } => MSG_TYPE_JOB_CANCELLING,
            Self::JobCompleted { .. } => MSG_TYPE_JOB_COMPLETED,
            Self::JobFailed { .. } => MSG_TYPE_JOB_FAILED,
            Self::JobCancelled { .. } => MSG_TYPE_JOB_CANCELLED,
            Self::ReclaimCompleted { .. } => MSG_TYPE_RECLAIM_COMPLETED,
            Self::HealthWarning { .. } => MSG_TYPE_HEALTH_WARNING,
            Self::QueueShutdown { .. } => MSG_TYPE_QUEUE_SHUTDOWN,
        }
    }

    /// The job this event is about, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::JobSubmitted { job_id, .. }
            | Self::JobStarted { job_id, .. }
            | Self::JobProgress { job_id, .. }
            | Self::JobCancelling { job_id, .. }
            | Self::JobCompleted { job_id, .. }
            | Self::JobFailed { job_id, .. }
            | Self::JobCancelled { job_id, .. }
            | Self::ReclaimCompleted { job_id, .. } => Some(*job_id),
            Self::HealthWarning { warning, .. } => warning.job_id(),
            Self::QueueShutdown { .. } => None,
        }
    }

    /// Whether this event reports a job reaching a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::JobCompleted { .. } | Self::JobFailed { .. } | Self::JobCancelled { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
pub const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of subscribers can
/// independently receive every published [`QueueEvent`].
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: QueueEvent) {
        // Ignore the SendError; it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
