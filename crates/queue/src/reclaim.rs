//! GPU memory reclamation after every job.
//!
//! Wraps [`ExecutionBackend::release_memory`] with a small bounded retry.
//! A release issued while the backend is still tearing down a forced
//! cancellation can race and silently fail.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use switchgen_core::backend::ExecutionBackend;

/// Default number of release attempts per reclaim.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default pause between release attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Retry policy for [`ResourceReclaimer::reclaim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimPolicy {
    /// Total attempts, including the first. Must be at least 1.
    pub max_attempts: u32,
    /// Pause between consecutive attempts.
    pub retry_delay: Duration,
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Outcome of one reclaim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReclaimResult {
    pub released: bool,
    /// Number of release calls made.
    pub attempts: u32,
    pub detail: String,
}

/// Releases GPU memory held by the backend's last run.
pub struct ResourceReclaimer {
    backend: Arc<dyn ExecutionBackend>,
    policy: ReclaimPolicy,
}

impl ResourceReclaimer {
    pub fn new(backend: Arc<dyn ExecutionBackend>, policy: ReclaimPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> ReclaimPolicy {
        self.policy
    }

    /// Release GPU memory, retrying up to the policy bound.
    ///
    /// Idempotent: with nothing allocated the backend reports success and
    /// this returns after one attempt. Never fails; a result with
    /// `released == false` is a degraded-mode signal for the caller.
    pub async fn reclaim(&self) -> ReclaimResult {
        let max_attempts = self.policy.max_attempts.max(1);
        let start = Instant::now();
        let mut last_detail = String::new();

        for attempt in 1..=max_attempts {
            match self.backend.release_memory().await {
                Ok(true) => {
                    tracing::debug!(
                        attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "GPU memory released",
                    );
                    return ReclaimResult {
                        released: true,
                        attempts: attempt,
                        detail: if attempt == 1 {
                            "released".to_string()
                        } else {
                            format!("released after {attempt} attempts")
                        },
                    };
                }
                Ok(false) => {
                    last_detail = "backend reported memory still held".to_string();
                }
                Err(e) => {
                    last_detail = e.to_string();
                }
            }

            tracing::warn!(
                attempt,
                max_attempts,
                detail = %last_detail,
                "GPU memory release attempt failed",
            );

            if attempt < max_attempts {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }

        ReclaimResult {
            released: false,
            attempts: max_attempts,
            detail: last_detail,
        }
    }
}
