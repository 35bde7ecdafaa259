//! Exponential-backoff connection logic for ComfyUI WebSocket
//! connections.
//!
//! A ComfyUI server that was just (re)started takes a few seconds to
//! accept connections. [`connect_with_backoff`] keeps retrying with
//! increasing delays until the connection succeeds, the attempt budget
//! runs out, or the [`CancellationToken`] is triggered.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIClientError, ComfyUIConnection};

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the second connection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Total connection attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Connect to a ComfyUI instance, retrying with exponential backoff.
///
/// Returns the last connection error once `max_attempts` is exhausted,
/// or [`ComfyUIClientError::Cancelled`] if `cancel` fires first.
pub async fn connect_with_backoff(
    client: &ComfyUIClient,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Result<ComfyUIConnection, ComfyUIClientError> {
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let result = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::info!(ws_url = client.ws_url(), "Connect cancelled");
                return Err(ComfyUIClientError::Cancelled);
            }
            result = client.connect() => result,
        };

        match result {
            Ok(conn) => {
                if attempt > 1 {
                    tracing::info!(ws_url = client.ws_url(), attempt, "Connected to ComfyUI");
                }
                return Ok(conn);
            }
            Err(e) if attempt >= max_attempts => {
                tracing::error!(
                    ws_url = client.ws_url(),
                    attempt,
                    error = %e,
                    "Giving up connecting to ComfyUI",
                );
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(
                    ws_url = client.ws_url(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Connect attempt failed, retrying",
                );
            }
        }

        // Wait before the next attempt, respecting cancellation.
        tokio::select! {
            _ = cancel.cancelled() => return Err(ComfyUIClientError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        delay = next_delay(delay, config);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn next_delay_doubles() {
        let config = ReconnectConfig::default();
        let d = next_delay(Duration::from_secs(1), &config);
        assert_eq!(d, Duration::from_secs(2));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let config = ReconnectConfig {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let d = next_delay(Duration::from_secs(8), &config);
        assert_eq!(d, Duration::from_secs(10));
    }

    #[test]
    fn custom_multiplier() {
        let config = ReconnectConfig {
            multiplier: 3.0,
            max_delay: Duration::from_secs(60),
            ..Default::default()
        };
        let d = next_delay(Duration::from_secs(2), &config);
        assert_eq!(d, Duration::from_secs(6));
    }

    #[test]
    fn full_backoff_sequence() {
        let config = ReconnectConfig::default();
        let mut delay = config.initial_delay;
        let expected = [1, 2, 4, 8, 16, 30, 30, 30];

        for &expected_secs in &expected {
            assert_eq!(delay.as_secs(), expected_secs);
            delay = next_delay(delay, &config);
        }
    }

    #[tokio::test]
    async fn cancelled_token_stops_connecting() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let client = ComfyUIClient::from_api_url("http://127.0.0.1:9");
        let result = connect_with_backoff(&client, &ReconnectConfig::default(), &cancel).await;
        assert_matches!(result, Err(ComfyUIClientError::Cancelled));
    }
}
