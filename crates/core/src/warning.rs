//! Degraded-mode signals surfaced to callers.
//!
//! None of these fail a job. They are published on the event bus and
//! recorded in process-wide health state so an external supervisor can
//! decide whether to restart the core.

use serde::{Deserialize, Serialize};

use crate::types::JobId;
use crate::vram::VramLevel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthWarning {
    /// GPU memory was not released after the bounded number of attempts.
    #[error("Reclaim failed after job {job_id} ({attempts} attempts): {detail}")]
    ReclaimFailure {
        job_id: JobId,
        attempts: u32,
        detail: String,
    },

    /// The backend did not honour an interrupt within the bound and the
    /// job was force-cancelled.
    #[error("Backend ignored interrupt for job {job_id} after {waited_ms} ms")]
    CancelTimeout { job_id: JobId, waited_ms: u64 },

    /// VRAM usage after a reclaim is above the warning threshold.
    #[error("VRAM pressure ({level:?}): {used_bytes} of {total_bytes} bytes in use")]
    VramPressure {
        level: VramLevel,
        used_bytes: u64,
        total_bytes: u64,
    },
}

impl HealthWarning {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::ReclaimFailure { job_id, .. } | Self::CancelTimeout { job_id, .. } => {
                Some(*job_id)
            }
            Self::VramPressure { .. } => None,
        }
    }
}
