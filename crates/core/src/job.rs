//! Job record and lifecycle state machine.
//!
//! A [`Job`] is created `Pending` at enqueue time and walks a monotonic
//! transition graph until it reaches one of the terminal states:
//!
//! ```text
//! Pending ──> Running ──> Completed
//!    │           ├──────> Failed
//!    │           └──────> Cancelling ──> Cancelled
//!    └──────────────────────────────────> Cancelled
//! ```
//!
//! All mutators validate the transition and refuse to touch a job that
//! has already reached a terminal state.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// `Completed`, `Failed` or `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The job currently owns the backend (`Running` or `Cancelling`).
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Cancelling)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelling)
                | (Cancelling, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

/// A fully resolved generation request.
///
/// `graph` is the ready-to-run execution graph produced by the workflow
/// builder. The queue never inspects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub graph: serde_json::Value,
    /// Optional human-readable label shown in logs.
    #[serde(default)]
    pub label: Option<String>,
}

impl GenerationRequest {
    pub fn new(graph: serde_json::Value) -> Self {
        Self { graph, label: None }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Latest progress snapshot reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub current_step: u32,
    pub total_steps: u32,
    /// The node currently executing, if known.
    pub current_node: Option<String>,
}

impl ProgressInfo {
    /// Completion percentage of the current node (0-100).
    pub fn percent(&self) -> u8 {
        if self.total_steps == 0 {
            return 0;
        }
        let pct = (u64::from(self.current_step) * 100) / u64::from(self.total_steps);
        pct.min(100) as u8
    }
}

/// Successful result of a backend run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    /// Backend-side identifier of the execution, when the backend has one.
    pub prompt_id: Option<String>,
    /// Raw outputs keyed by producing node (images, filenames, etc.).
    pub outputs: serde_json::Value,
}

/// Backend-reported failure detail recorded on a `Failed` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    pub node_id: Option<String>,
    pub exception_type: Option<String>,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            node_id: None,
            exception_type: None,
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.exception_type, &self.node_id) {
            (Some(kind), Some(node)) => write!(f, "{kind} in node {node}: {}", self.message),
            (Some(kind), None) => write!(f, "{kind}: {}", self.message),
            (None, Some(node)) => write!(f, "node {node}: {}", self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One generation request plus its lifecycle state.
///
/// Values handed to callers are point-in-time copies; the request itself
/// is shared behind an `Arc` and never mutated after enqueue.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub request: Arc<GenerationRequest>,
    pub status: JobStatus,
    pub submitted_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub result: Option<JobOutput>,
    pub error: Option<JobFailure>,
    pub progress: Option<ProgressInfo>,
    /// Set when the job was cancelled at the interrupt deadline without
    /// the backend acknowledging.
    pub cancel_forced: bool,
}

impl Job {
    /// Create a new `Pending` job with a fresh id.
    pub fn new(request: GenerationRequest) -> Self {
        Self {
            id: JobId::new(),
            request: Arc::new(request),
            status: JobStatus::Pending,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            progress: None,
            cancel_forced: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `Pending -> Running`.
    pub fn start(&mut self) -> Result<(), CoreError> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// `Running -> Cancelling`.
    pub fn begin_cancel(&mut self) -> Result<(), CoreError> {
        self.transition(JobStatus::Cancelling)
    }

    /// `Running -> Completed`, recording the result.
    pub fn complete(&mut self, output: JobOutput) -> Result<(), CoreError> {
        self.ensure_unset()?;
        self.transition(JobStatus::Completed)?;
        self.result = Some(output);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// `Running -> Failed`, recording the backend detail.
    pub fn fail(&mut self, failure: JobFailure) -> Result<(), CoreError> {
        self.ensure_unset()?;
        self.transition(JobStatus::Failed)?;
        self.error = Some(failure);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// `Pending -> Cancelled` or `Cancelling -> Cancelled`.
    pub fn cancel(&mut self, forced: bool) -> Result<(), CoreError> {
        self.transition(JobStatus::Cancelled)?;
        self.cancel_forced = forced;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Overwrite the progress snapshot. Only allowed while the job owns
    /// the backend.
    pub fn record_progress(&mut self, progress: ProgressInfo) -> Result<(), CoreError> {
        if !self.status.is_active() {
            return Err(CoreError::Validation(format!(
                "job {} is {} and cannot take progress updates",
                self.id, self.status
            )));
        }
        self.progress = Some(progress);
        Ok(())
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    fn ensure_unset(&self) -> Result<(), CoreError> {
        if self.result.is_some() {
            return Err(CoreError::AlreadySet {
                id: self.id,
                field: "result",
            });
        }
        if self.error.is_some() {
            return Err(CoreError::AlreadySet {
                id: self.id,
                field: "error",
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn job() -> Job {
        Job::new(GenerationRequest::new(serde_json::json!({"1": {}})))
    }

    fn output() -> JobOutput {
        JobOutput {
            prompt_id: Some("p-1".into()),
            outputs: serde_json::json!({"9": {"images": []}}),
        }
    }

    #[test]
    fn new_job_is_pending_with_no_outcome() {
        let j = job();
        assert_eq!(j.status, JobStatus::Pending);
        assert!(j.started_at.is_none());
        assert!(j.finished_at.is_none());
        assert!(j.result.is_none());
        assert!(j.error.is_none());
    }

    #[test]
    fn happy_path_sets_timestamps_once() {
        let mut j = job();
        j.start().unwrap();
        let started = j.started_at;
        assert!(started.is_some());

        j.complete(output()).unwrap();
        assert_eq!(j.status, JobStatus::Completed);
        assert_eq!(j.started_at, started);
        assert!(j.finished_at.unwrap() >= started.unwrap());
        assert!(j.result.is_some());
        assert!(j.error.is_none());
    }

    #[test]
    fn failure_records_error_but_not_result() {
        let mut j = job();
        j.start().unwrap();
        j.fail(JobFailure::new("out of memory")).unwrap();
        assert_eq!(j.status, JobStatus::Failed);
        assert_eq!(j.error.as_ref().unwrap().message, "out of memory");
        assert!(j.result.is_none());
    }

    #[test]
    fn terminal_jobs_are_frozen() {
        let mut j = job();
        j.start().unwrap();
        j.complete(output()).unwrap();

        assert_matches!(
            j.fail(JobFailure::new("late")),
            Err(CoreError::AlreadySet { field: "result", .. })
        );
        assert_matches!(j.cancel(false), Err(CoreError::InvalidTransition { .. }));
        assert_matches!(
            j.record_progress(ProgressInfo::default()),
            Err(CoreError::Validation(_))
        );
        assert_eq!(j.status, JobStatus::Completed);
    }

    #[test]
    fn never_returns_to_pending() {
        for from in [
            JobStatus::Running,
            JobStatus::Cancelling,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert!(!from.can_transition_to(JobStatus::Pending), "{from}");
        }
    }

    #[test]
    fn cancelling_only_resolves_to_cancelled() {
        let s = JobStatus::Cancelling;
        assert!(s.can_transition_to(JobStatus::Cancelled));
        assert!(!s.can_transition_to(JobStatus::Completed));
        assert!(!s.can_transition_to(JobStatus::Failed));
        assert!(!s.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn pending_cancel_skips_running() {
        let mut j = job();
        j.cancel(false).unwrap();
        assert_eq!(j.status, JobStatus::Cancelled);
        assert!(j.started_at.is_none());
        assert!(!j.cancel_forced);
    }

    #[test]
    fn forced_cancel_is_recorded() {
        let mut j = job();
        j.start().unwrap();
        j.begin_cancel().unwrap();
        j.cancel(true).unwrap();
        assert!(j.cancel_forced);
    }

    #[test]
    fn progress_only_while_active() {
        let mut j = job();
        assert!(j.record_progress(ProgressInfo::default()).is_err());

        j.start().unwrap();
        let p = ProgressInfo {
            current_step: 5,
            total_steps: 20,
            current_node: Some("3".into()),
        };
        j.record_progress(p.clone()).unwrap();
        assert_eq!(j.progress, Some(p));
    }

    #[test]
    fn percent_handles_zero_total() {
        assert_eq!(ProgressInfo::default().percent(), 0);
        let p = ProgressInfo {
            current_step: 5,
            total_steps: 20,
            current_node: None,
        };
        assert_eq!(p.percent(), 25);
    }

    #[test]
    fn failure_display_includes_context() {
        let f = JobFailure {
            message: "boom".into(),
            node_id: Some("5".into()),
            exception_type: Some("RuntimeError".into()),
        };
        assert_eq!(f.to_string(), "RuntimeError in node 5: boom");
    }
}
