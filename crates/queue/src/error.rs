use switchgen_core::error::CoreError;
use switchgen_core::types::JobId;

/// Errors returned by the queue and its facade.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Enqueue attempted after shutdown.
    #[error("Queue is closed")]
    QueueClosed,

    /// A second worker tried to attach to the same queue.
    #[error("A worker is already attached to this queue")]
    WorkerAlreadyAttached,

    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// Eviction of a job that has not reached a terminal state.
    #[error("Job {0} is still live and cannot be evicted")]
    NotTerminal(JobId),

    /// Another job already owns the backend.
    #[error("Job {active} is already running")]
    Busy { active: JobId },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}
