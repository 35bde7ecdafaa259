//! Process-wide health state.
//!
//! Reclaim failures and cancel timeouts never fail a job; they land here
//! so an external supervisor can decide when the core needs a restart.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use switchgen_core::vram::{VramLevel, VramUsage};
use switchgen_core::warning::HealthWarning;

use crate::reclaim::ReclaimResult;

/// Point-in-time copy of the health counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthReport {
    /// Jobs the worker has taken off the queue and finished with.
    pub jobs_processed: u64,
    pub reclaims_succeeded: u64,
    pub reclaims_failed: u64,
    /// Reclaim failures since the last successful reclaim.
    pub consecutive_reclaim_failures: u32,
    pub cancel_timeouts: u64,
    pub last_warning: Option<HealthWarning>,
    pub last_vram: Option<VramUsage>,
    pub vram_level: Option<VramLevel>,
}

impl HealthReport {
    /// Running with leaked memory or under critical VRAM pressure.
    pub fn is_degraded(&self) -> bool {
        self.consecutive_reclaim_failures > 0 || self.vram_level == Some(VramLevel::Critical)
    }

    /// Whether the run of consecutive reclaim failures has reached
    /// `threshold`. The restart policy itself lives outside the core.
    pub fn exceeds(&self, threshold: u32) -> bool {
        threshold > 0 && self.consecutive_reclaim_failures >= threshold
    }
}

/// Shared, lock-protected health counters.
#[derive(Default)]
pub struct HealthMonitor {
    report: Mutex<HealthReport>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HealthReport> {
        self.report.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn report(&self) -> HealthReport {
        self.lock().clone()
    }

    pub fn record_job_processed(&self) {
        self.lock().jobs_processed += 1;
    }

    /// Fold a reclaim result in. `warning` is recorded when the reclaim
    /// failed.
    pub fn record_reclaim(&self, result: &ReclaimResult, warning: Option<HealthWarning>) {
        let mut report = self.lock();
        if result.released {
            report.reclaims_succeeded += 1;
            report.consecutive_reclaim_failures = 0;
        } else {
            report.reclaims_failed += 1;
            report.consecutive_reclaim_failures += 1;
        }
        if let Some(warning) = warning {
            report.last_warning = Some(warning);
        }
    }

    pub fn record_cancel_timeout(&self, warning: HealthWarning) {
        let mut report = self.lock();
        report.cancel_timeouts += 1;
        report.last_warning = Some(warning);
    }

    pub fn record_vram(&self, usage: VramUsage, level: VramLevel, warning: Option<HealthWarning>) {
        let mut report = self.lock();
        report.last_vram = Some(usage);
        report.vram_level = Some(level);
        if let Some(warning) = warning {
            report.last_warning = Some(warning);
        }
    }
}
