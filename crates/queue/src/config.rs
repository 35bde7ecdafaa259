use std::str::FromStr;
use std::time::Duration;

use switchgen_core::vram::VramThresholds;

use crate::error::ConfigError;
use crate::reclaim::ReclaimPolicy;

/// Default bound on how long a cancelled job may take to stop.
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Queue and worker policy.
///
/// All fields have defaults suitable for a single local GPU. Override
/// via environment variables with [`QueueConfig::from_env`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long the worker waits for the backend to honour an interrupt
    /// before force-cancelling the job.
    pub cancel_timeout: Duration,
    /// Retry policy for releasing GPU memory after each job.
    pub reclaim: ReclaimPolicy,
    /// VRAM usage fractions that trigger health warnings.
    pub vram: VramThresholds,
    /// Buffer capacity of the event bus.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
            reclaim: ReclaimPolicy::default(),
            vram: VramThresholds::default(),
            event_capacity: switchgen_events::bus::DEFAULT_CAPACITY,
        }
    }
}

impl QueueConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default |
    /// |-------------------------------|---------|
    /// | `SWITCHGEN_CANCEL_TIMEOUT_MS` | `10000` |
    /// | `SWITCHGEN_RECLAIM_ATTEMPTS`  | `3`     |
    /// | `SWITCHGEN_RECLAIM_RETRY_MS`  | `500`   |
    /// | `SWITCHGEN_VRAM_WARNING`      | `0.85`  |
    /// | `SWITCHGEN_VRAM_CRITICAL`     | `0.95`  |
    /// | `SWITCHGEN_EVENT_CAPACITY`    | `1024`  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Used by [`from_env`]
    /// and by tests that must not touch the process environment.
    ///
    /// [`from_env`]: Self::from_env
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let cancel_timeout_ms: u64 = parse_or(
            &lookup,
            "SWITCHGEN_CANCEL_TIMEOUT_MS",
            defaults.cancel_timeout.as_millis() as u64,
        )?;
        let max_attempts: u32 = parse_or(
            &lookup,
            "SWITCHGEN_RECLAIM_ATTEMPTS",
            defaults.reclaim.max_attempts,
        )?;
        let retry_ms: u64 = parse_or(
            &lookup,
            "SWITCHGEN_RECLAIM_RETRY_MS",
            defaults.reclaim.retry_delay.as_millis() as u64,
        )?;
        let warning: f64 = parse_or(&lookup, "SWITCHGEN_VRAM_WARNING", defaults.vram.warning)?;
        let critical: f64 = parse_or(&lookup, "SWITCHGEN_VRAM_CRITICAL", defaults.vram.critical)?;
        let event_capacity: usize =
            parse_or(&lookup, "SWITCHGEN_EVENT_CAPACITY", defaults.event_capacity)?;

        let config = Self {
            cancel_timeout: Duration::from_millis(cancel_timeout_ms),
            reclaim: ReclaimPolicy {
                max_attempts,
                retry_delay: Duration::from_millis(retry_ms),
            },
            vram: VramThresholds { warning, critical },
            event_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reclaim.max_attempts == 0 {
            return Err(invalid("SWITCHGEN_RECLAIM_ATTEMPTS", "must be at least 1"));
        }
        if self.event_capacity == 0 {
            return Err(invalid("SWITCHGEN_EVENT_CAPACITY", "must be at least 1"));
        }
        for (key, value) in [
            ("SWITCHGEN_VRAM_WARNING", self.vram.warning),
            ("SWITCHGEN_VRAM_CRITICAL", self.vram.critical),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(invalid(key, "must be a fraction in (0, 1]"));
            }
        }
        if self.vram.warning > self.vram.critical {
            return Err(invalid(
                "SWITCHGEN_VRAM_WARNING",
                "must not exceed SWITCHGEN_VRAM_CRITICAL",
            ));
        }
        Ok(())
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| invalid(key, e)),
        None => Ok(default),
    }
}

fn invalid(key: &str, message: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = QueueConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.cancel_timeout, DEFAULT_CANCEL_TIMEOUT);
        assert_eq!(config.reclaim.max_attempts, 3);
        assert_eq!(config.reclaim.retry_delay, Duration::from_millis(500));
        assert_eq!(config.vram, VramThresholds::default());
        assert_eq!(config.event_capacity, 1024);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("SWITCHGEN_CANCEL_TIMEOUT_MS", "2500"),
            ("SWITCHGEN_RECLAIM_ATTEMPTS", " 5 "),
            ("SWITCHGEN_VRAM_WARNING", "0.7"),
        ]))
        .unwrap();
        assert_eq!(config.cancel_timeout, Duration::from_millis(2500));
        assert_eq!(config.reclaim.max_attempts, 5);
        assert_eq!(config.vram.warning, 0.7);
    }

    #[test]
    fn garbage_is_rejected_with_key() {
        let err = QueueConfig::from_lookup(lookup(&[("SWITCHGEN_RECLAIM_RETRY_MS", "soon")]))
            .unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { key, .. } if key == "SWITCHGEN_RECLAIM_RETRY_MS");
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let err =
            QueueConfig::from_lookup(lookup(&[("SWITCHGEN_RECLAIM_ATTEMPTS", "0")])).unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { .. });
    }

    #[test]
    fn warning_above_critical_is_rejected() {
        let err = QueueConfig::from_lookup(lookup(&[
            ("SWITCHGEN_VRAM_WARNING", "0.9"),
            ("SWITCHGEN_VRAM_CRITICAL", "0.8"),
        ]))
        .unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { key, .. } if key == "SWITCHGEN_VRAM_WARNING");
    }
}
