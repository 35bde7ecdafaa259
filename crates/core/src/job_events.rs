//! Event type names for queue lifecycle notifications.
//!
//! Used as the `type` tag when queue events are serialized for
//! subscribers outside the process (log shippers, front-ends).

/// A job was accepted into the pending queue.
pub const MSG_TYPE_JOB_SUBMITTED: &str = "job_submitted";

/// The worker claimed a job and handed it to the backend.
pub const MSG_TYPE_JOB_STARTED: &str = "job_started";

/// Progress update during job execution (step + current node).
pub const MSG_TYPE_JOB_PROGRESS: &str = "job_progress";

/// A cancel request reached the running job; waiting for the backend to stop.
pub const MSG_TYPE_JOB_CANCELLING: &str = "job_cancelling";

/// Job completed successfully.
pub const MSG_TYPE_JOB_COMPLETED: &str = "job_completed";

/// Job failed with a backend error.
pub const MSG_TYPE_JOB_FAILED: &str = "job_failed";

/// Job was cancelled (while pending, cooperatively, or forced at the timeout).
pub const MSG_TYPE_JOB_CANCELLED: &str = "job_cancelled";

/// GPU memory was released after a job.
pub const MSG_TYPE_RECLAIM_COMPLETED: &str = "reclaim_completed";

/// Degraded-mode signal (reclaim failure, cancel timeout, VRAM pressure).
pub const MSG_TYPE_HEALTH_WARNING: &str = "health_warning";

/// The queue stopped accepting jobs.
pub const MSG_TYPE_QUEUE_SHUTDOWN: &str = "queue_shutdown";
