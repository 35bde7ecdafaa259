//! VRAM usage snapshots and threshold evaluation.
//!
//! Pure logic. The worker samples usage from the backend after each
//! reclaim and classifies it here.

use serde::{Deserialize, Serialize};

/// Default fraction of VRAM in use before a warning is raised.
pub const DEFAULT_WARNING_THRESHOLD: f64 = 0.85;

/// Default fraction of VRAM in use before usage is considered critical.
pub const DEFAULT_CRITICAL_THRESHOLD: f64 = 0.95;

/// Point-in-time GPU memory usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VramUsage {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl VramUsage {
    /// Fraction of total memory in use, `0.0` when the total is unknown.
    pub fn used_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes as f64 / self.total_bytes as f64).clamp(0.0, 1.0)
    }
}

/// Severity of a VRAM usage sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VramLevel {
    Normal,
    Warning,
    Critical,
}

/// Warning / critical fractions used to classify a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VramThresholds {
    pub warning: f64,
    pub critical: f64,
}

impl Default for VramThresholds {
    fn default() -> Self {
        Self {
            warning: DEFAULT_WARNING_THRESHOLD,
            critical: DEFAULT_CRITICAL_THRESHOLD,
        }
    }
}

impl VramThresholds {
    pub fn evaluate(&self, usage: &VramUsage) -> VramLevel {
        let fraction = usage.used_fraction();
        if fraction >= self.critical {
            VramLevel::Critical
        } else if fraction >= self.warning {
            VramLevel::Warning
        } else {
            VramLevel::Normal
        }
    }
}
