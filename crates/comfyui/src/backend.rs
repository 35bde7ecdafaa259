//! [`ExecutionBackend`] implementation over a ComfyUI server.
//!
//! Each `run` opens a fresh WebSocket with its own client ID, submits
//! the graph over HTTP with that ID, and follows the prompt with
//! [`track_prompt`] until it finishes. Interrupts and memory release map
//! to `POST /interrupt` and `POST /free`.
//!
//! ComfyUI only acts on `/free` once its executor is idle, so a 2xx does
//! not mean the memory is gone. `release_memory` re-reads
//! `/system_stats` and reports success only when PyTorch's reserved
//! memory has dropped to within [`DEFAULT_RELEASE_TOLERANCE`] bytes.

use async_trait::async_trait;
use switchgen_core::backend::{BackendError, ExecutionBackend, ProgressSender};
use switchgen_core::job::JobOutput;
use switchgen_core::vram::VramUsage;
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, ComfyUIApiError, SystemStats};
use crate::client::{derive_ws_url, ComfyUIClient, ComfyUIClientError};
use crate::reconnect::{connect_with_backoff, ReconnectConfig};
use crate::tracker::track_prompt;

/// Reserved bytes still counted as released (CUDA context, cuBLAS workspace).
pub const DEFAULT_RELEASE_TOLERANCE: u64 = 256 * 1024 * 1024;

/// A single ComfyUI instance driven as the queue's execution engine.
pub struct ComfyUIBackend {
    api: ComfyUIApi,
    client: ComfyUIClient,
    reconnect: ReconnectConfig,
    release_tolerance: u64,
    /// Aborts pending connection attempts on shutdown.
    shutdown: CancellationToken,
}

impl ComfyUIBackend {
    /// * `api_url` - HTTP base URL, e.g. `http://127.0.0.1:8188`.
    /// * `ws_url`  - WebSocket base URL; derived from `api_url` when `None`.
    pub fn new(api_url: &str, ws_url: Option<&str>) -> Self {
        let ws_url = ws_url.map_or_else(|| derive_ws_url(api_url), str::to_string);
        Self {
            api: ComfyUIApi::new(api_url.to_string()),
            client: ComfyUIClient::new(ws_url, api_url.to_string()),
            reconnect: ReconnectConfig::default(),
            release_tolerance: DEFAULT_RELEASE_TOLERANCE,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_release_tolerance(mut self, bytes: u64) -> Self {
        self.release_tolerance = bytes;
        self
    }

    /// Stop retrying connections. In-flight runs are left to the caller.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }
}

#[async_trait]
impl ExecutionBackend for ComfyUIBackend {
    async fn run(
        &self,
        graph: &serde_json::Value,
        progress: ProgressSender,
    ) -> Result<JobOutput, BackendError> {
        let mut conn = connect_with_backoff(&self.client, &self.reconnect, &self.shutdown)
            .await
            .map_err(BackendError::from)?;

        let submitted = self.api.submit_workflow(graph, &conn.client_id).await?;
        if submitted
            .node_errors
            .as_object()
            .is_some_and(|errors| !errors.is_empty())
        {
            return Err(BackendError::Protocol(format!(
                "ComfyUI rejected the workflow: {}",
                submitted.node_errors
            )));
        }

        tracing::info!(
            prompt_id = %submitted.prompt_id,
            queue_number = submitted.number,
            client_id = %conn.client_id,
            "Workflow submitted to ComfyUI",
        );

        let result = track_prompt(&mut conn.ws_stream, &submitted.prompt_id, &progress).await;

        if let Err(e) = conn.ws_stream.close(None).await {
            tracing::debug!(error = %e, "Failed to close ComfyUI WebSocket cleanly");
        }
        result
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        self.api.interrupt().await?;
        tracing::debug!(api_url = self.api.api_url(), "Interrupt sent to ComfyUI");
        Ok(())
    }

    async fn release_memory(&self) -> Result<bool, BackendError> {
        self.api.free_memory(true, true).await?;
        let stats = self.api.system_stats().await?;
        Ok(memory_released(&stats, self.release_tolerance))
    }

    async fn vram_usage(&self) -> Option<VramUsage> {
        match self.api.system_stats().await {
            Ok(stats) => stats.primary_vram(),
            Err(e) => {
                tracing::debug!(error = %e, "Failed to read ComfyUI system stats");
                None
            }
        }
    }
}

/// Whether `stats` show the first device's allocator drained to within
/// `tolerance` bytes.
///
/// A server without devices has nothing to hold. A server that does not
/// report allocator stats cannot be checked, so an accepted `/free` is
/// taken at its word.
fn memory_released(stats: &SystemStats, tolerance: u64) -> bool {
    let Some(device) = stats.devices.first() else {
        return true;
    };
    match stats.primary_torch_reserved() {
        Some(reserved) if reserved > tolerance => {
            tracing::debug!(
                device = %device.name,
                reserved_bytes = reserved,
                tolerance_bytes = tolerance,
                "ComfyUI still holds GPU memory after /free",
            );
            false
        }
        Some(_) => true,
        None => {
            tracing::debug!(device = %device.name, "No allocator stats; trusting /free");
            true
        }
    }
}

impl From<ComfyUIApiError> for BackendError {
    fn from(err: ComfyUIApiError) -> Self {
        match err {
            ComfyUIApiError::Request(e) => BackendError::Transport(e.to_string()),
            ComfyUIApiError::ApiError { status, body } => {
                BackendError::Protocol(format!("ComfyUI returned {status}: {body}"))
            }
        }
    }
}

impl From<ComfyUIClientError> for BackendError {
    fn from(err: ComfyUIClientError) -> Self {
        BackendError::Transport(err.to_string())
    }
}
