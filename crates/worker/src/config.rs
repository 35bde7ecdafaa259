use switchgen_comfyui::backend::DEFAULT_RELEASE_TOLERANCE;
use switchgen_queue::{ConfigError, QueueConfig};

/// Default ComfyUI HTTP endpoint.
pub const DEFAULT_COMFYUI_URL: &str = "http://127.0.0.1:8188";

const MIB: u64 = 1024 * 1024;

/// Worker process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// ComfyUI HTTP base URL.
    pub comfyui_url: String,
    /// ComfyUI WebSocket base URL; derived from `comfyui_url` when unset.
    pub comfyui_ws_url: Option<String>,
    /// PyTorch-reserved bytes still treated as released after `/free`.
    pub release_tolerance_bytes: u64,
    /// Queue and worker policy.
    pub queue: QueueConfig,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default                    |
    /// |--------------------------------|----------------------------|
    /// | `COMFYUI_URL`                  | `http://127.0.0.1:8188`    |
    /// | `COMFYUI_WS_URL`               | derived from `COMFYUI_URL` |
    /// | `COMFYUI_RELEASE_TOLERANCE_MB` | `256`                      |
    ///
    /// Queue settings are read by [`QueueConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let comfyui_url = non_empty(lookup("COMFYUI_URL"))
            .unwrap_or_else(|| DEFAULT_COMFYUI_URL.to_string());
        if !comfyui_url.starts_with("http://") && !comfyui_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                key: "COMFYUI_URL".into(),
                message: format!("expected an http(s) URL, got {comfyui_url:?}"),
            });
        }

        let comfyui_ws_url = non_empty(lookup("COMFYUI_WS_URL"));
        if let Some(ref ws) = comfyui_ws_url {
            if !ws.starts_with("ws://") && !ws.starts_with("wss://") {
                return Err(ConfigError::InvalidValue {
                    key: "COMFYUI_WS_URL".into(),
                    message: format!("expected a ws(s) URL, got {ws:?}"),
                });
            }
        }

        let release_tolerance_bytes = match non_empty(lookup("COMFYUI_RELEASE_TOLERANCE_MB")) {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|e| ConfigError::InvalidValue {
                    key: "COMFYUI_RELEASE_TOLERANCE_MB".into(),
                    message: e.to_string(),
                })?
                .saturating_mul(MIB),
            None => DEFAULT_RELEASE_TOLERANCE,
        };

        let queue = QueueConfig::from_lookup(&lookup)?;

        Ok(Self {
            comfyui_url,
            comfyui_ws_url,
            release_tolerance_bytes,
            queue,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
