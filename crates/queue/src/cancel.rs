//! Cooperative cancellation of the in-flight job.
//!
//! The worker arms the controller with the id of the job it is about to
//! run and watches the returned [`CancellationToken`]. Callers (or an
//! interrupt keystroke) trip the token; nothing is ever killed outright.

use std::sync::{Mutex, MutexGuard, PoisonError};

use switchgen_core::types::JobId;
use tokio_util::sync::CancellationToken;

/// The single outstanding cancellation target.
struct ArmedTarget {
    job_id: JobId,
    token: CancellationToken,
}

/// Routes cancel requests to the job the worker is currently running.
///
/// At most one target is armed at a time, matching the single-worker
/// discipline.
#[derive(Default)]
pub struct CancellationController {
    target: Mutex<Option<ArmedTarget>>,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<ArmedTarget>> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `job_id` the current target and return the token the worker
    /// should watch. Replaces any stale target.
    pub fn arm(&self, job_id: JobId) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = self.lock().replace(ArmedTarget {
            job_id,
            token: token.clone(),
        });
        if let Some(stale) = previous {
            tracing::warn!(
                job_id = %stale.job_id,
                "Replacing cancellation target that was never disarmed",
            );
        }
        token
    }

    /// Clear the target if it still belongs to `job_id`.
    pub fn disarm(&self, job_id: JobId) {
        let mut target = self.lock();
        if target.as_ref().is_some_and(|t| t.job_id == job_id) {
            *target = None;
        }
    }

    /// Ask the running job `job_id` to stop at its next check point.
    ///
    /// Returns `false` (and does nothing) if `job_id` is not the job
    /// currently running.
    pub fn request_cancel(&self, job_id: JobId) -> bool {
        match self.lock().as_ref() {
            Some(target) if target.job_id == job_id => {
                if !target.token.is_cancelled() {
                    tracing::info!(job_id = %job_id, "Cancellation requested");
                    target.token.cancel();
                }
                true
            }
            _ => false,
        }
    }

    /// Cancel whatever is running right now (e.g. on Ctrl-C).
    ///
    /// Returns the id of the job that was signalled, if any.
    pub fn cancel_current(&self) -> Option<JobId> {
        let guard = self.lock();
        let target = guard.as_ref()?;
        if !target.token.is_cancelled() {
            tracing::info!(job_id = %target.job_id, "Interrupt requested for current job");
            target.token.cancel();
        }
        Some(target.job_id)
    }

    pub fn is_cancel_requested(&self, job_id: JobId) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|t| t.job_id == job_id && t.token.is_cancelled())
    }

    /// Id of the job currently armed, if any.
    pub fn current(&self) -> Option<JobId> {
        self.lock().as_ref().map(|t| t.job_id)
    }
}
