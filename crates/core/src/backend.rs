//! Contract for the GPU-bound execution engine.
//!
//! The queue never talks to a GPU directly. It drives an injected
//! [`ExecutionBackend`] that runs one execution graph at a time, streams
//! progress while running, honours a best-effort interrupt, and exposes a
//! memory-release primitive the queue calls after every job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::job::{JobFailure, JobOutput, ProgressInfo};
use crate::vram::VramUsage;

/// Sending half handed to [`ExecutionBackend::run`] for progress events.
pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;

/// Receiving half drained by the worker while a run is in flight.
pub type ProgressReceiver = mpsc::UnboundedReceiver<ProgressEvent>;

/// Create a progress channel pair.
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Progress emitted by a backend while a graph is executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Step-level progress within the current node (e.g. sampler steps).
    Step { value: u32, max: u32 },
    /// A node started executing.
    NodeStarted { node: String },
    /// A node finished and produced output.
    NodeCompleted { node: String },
    /// Nodes served from the backend's cache without executing.
    Cached { nodes: Vec<String> },
}

impl ProgressEvent {
    /// Fold this event into the job's latest progress snapshot.
    pub fn apply(&self, progress: &mut ProgressInfo) {
        match self {
            Self::Step { value, max } => {
                progress.current_step = *value;
                progress.total_steps = *max;
            }
            Self::NodeStarted { node } => {
                progress.current_node = Some(node.clone());
                progress.current_step = 0;
                progress.total_steps = 0;
            }
            Self::NodeCompleted { .. } | Self::Cached { .. } => {}
        }
    }
}

/// Errors reported by an execution backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The graph failed inside the engine.
    #[error("Execution error in node {node_id} ({exception_type}): {message}")]
    Execution {
        node_id: String,
        exception_type: String,
        message: String,
    },

    /// The run stopped because [`ExecutionBackend::interrupt`] was honoured.
    #[error("Execution interrupted")]
    Interrupted,

    /// The engine could not be reached or the connection dropped.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The engine answered with something the adapter did not understand.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<&BackendError> for JobFailure {
    fn from(err: &BackendError) -> Self {
        match err {
            BackendError::Execution {
                node_id,
                exception_type,
                message,
            } => JobFailure {
                message: message.clone(),
                node_id: Some(node_id.clone()),
                exception_type: Some(exception_type.clone()),
            },
            other => JobFailure::new(other.to_string()),
        }
    }
}

/// A stateful, single-GPU execution engine.
///
/// Implementations must tolerate `interrupt` and `release_memory` being
/// called at any time, including when nothing is running.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Run one execution graph to completion.
    ///
    /// Progress is pushed through `progress` while the future is pending.
    /// The future may be dropped by the caller if the run is abandoned.
    async fn run(
        &self,
        graph: &serde_json::Value,
        progress: ProgressSender,
    ) -> Result<JobOutput, BackendError>;

    /// Ask the current run to stop early. Not guaranteed to take effect
    /// immediately, or at all.
    async fn interrupt(&self) -> Result<(), BackendError>;

    /// Free every GPU allocation held by the last run.
    ///
    /// Idempotent: returns `Ok(true)` when nothing was allocated.
    async fn release_memory(&self) -> Result<bool, BackendError>;

    /// Current VRAM usage, when the backend can report it.
    async fn vram_usage(&self) -> Option<VramUsage> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_start_resets_step_counter() {
        let mut p = ProgressInfo {
            current_step: 20,
            total_steps: 20,
            current_node: Some("3".into()),
        };
        ProgressEvent::NodeStarted { node: "8".into() }.apply(&mut p);
        assert_eq!(p.current_node.as_deref(), Some("8"));
        assert_eq!(p.current_step, 0);

        ProgressEvent::Step { value: 4, max: 10 }.apply(&mut p);
        assert_eq!(p.percent(), 40);
        assert_eq!(p.current_node.as_deref(), Some("8"));
    }

    #[test]
    fn execution_error_maps_to_failure_detail() {
        let err = BackendError::Execution {
            node_id: "5".into(),
            exception_type: "RuntimeError".into(),
            message: "CUDA out of memory".into(),
        };
        let failure = JobFailure::from(&err);
        assert_eq!(failure.node_id.as_deref(), Some("5"));
        assert_eq!(failure.exception_type.as_deref(), Some("RuntimeError"));
        assert_eq!(failure.message, "CUDA out of memory");
    }

    #[test]
    fn transport_error_maps_to_plain_message() {
        let failure = JobFailure::from(&BackendError::Transport("socket closed".into()));
        assert_eq!(failure.message, "Transport error: socket closed");
        assert!(failure.node_id.is_none());
    }
}
