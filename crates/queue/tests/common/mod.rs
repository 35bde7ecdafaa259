//! Shared fixtures for the queue integration tests.
//!
//! [`MockBackend`] plays a scripted GPU engine: every `run` pops the next
//! [`Script`], every call is appended to a log, and the number of
//! overlapping runs is tracked so tests can assert the single-job rule.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use switchgen_core::backend::{BackendError, ExecutionBackend, ProgressEvent, ProgressSender};
use switchgen_core::job::{GenerationRequest, JobOutput};
use switchgen_core::vram::VramUsage;
use switchgen_events::QueueEvent;
use switchgen_queue::reclaim::ReclaimPolicy;
use switchgen_queue::QueueConfig;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// How the next `run` call behaves.
#[derive(Debug, Clone)]
pub enum Script {
    /// Emit `steps` progress steps, `step_delay` apart, then succeed.
    /// Stops early with `Interrupted` if interrupted.
    Succeed { steps: u32, step_delay: Duration },
    /// Fail immediately with the given error.
    Fail(BackendError),
    /// Never finish on its own. With `ack_interrupt` the run returns
    /// `Interrupted` once interrupted; without it the run ignores the
    /// interrupt entirely.
    Hang { ack_interrupt: bool },
}

impl Default for Script {
    fn default() -> Self {
        Self::Succeed {
            steps: 2,
            step_delay: Duration::from_millis(10),
        }
    }
}

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `run` for the graph whose `name` field is given.
    Run(String),
    Interrupt,
    Release,
}

#[derive(Default)]
pub struct MockBackend {
    scripts: Mutex<VecDeque<Script>>,
    releases: Mutex<VecDeque<Result<bool, BackendError>>>,
    calls: Mutex<Vec<Call>>,
    current_run: Mutex<Option<CancellationToken>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    vram: Mutex<Option<VramUsage>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue up behaviours for successive `run` calls. Unscripted runs use
    /// [`Script::default`].
    pub fn with_scripts(scripts: Vec<Script>) -> Arc<Self> {
        let backend = Self::default();
        *backend.scripts.lock().unwrap() = scripts.into();
        Arc::new(backend)
    }

    /// Queue up results for successive `release_memory` calls. Unscripted
    /// calls succeed.
    pub fn script_releases(&self, results: Vec<Result<bool, BackendError>>) {
        self.releases.lock().unwrap().extend(results);
    }

    pub fn set_vram(&self, usage: VramUsage) {
        *self.vram.lock().unwrap() = Some(usage);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn runs(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Run(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    /// Highest number of `run` calls ever in flight at once.
    pub fn max_concurrent_runs(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

/// Decrements the running counter even when the run future is dropped.
struct RunGuard<'a>(&'a AtomicUsize);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    async fn run(
        &self,
        graph: &serde_json::Value,
        progress: ProgressSender,
    ) -> Result<JobOutput, BackendError> {
        let name = graph["name"].as_str().unwrap_or_default().to_string();
        self.record(Call::Run(name.clone()));

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let _guard = RunGuard(&self.running);

        let interrupted = CancellationToken::new();
        *self.current_run.lock().unwrap() = Some(interrupted.clone());

        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        match script {
            Script::Succeed { steps, step_delay } => {
                let _ = progress.send(ProgressEvent::NodeStarted { node: "3".into() });
                for step in 1..=steps {
                    tokio::select! {
                        _ = tokio::time::sleep(step_delay) => {}
                        _ = interrupted.cancelled() => return Err(BackendError::Interrupted),
                    }
                    let _ = progress.send(ProgressEvent::Step {
                        value: step,
                        max: steps,
                    });
                }
                let _ = progress.send(ProgressEvent::NodeCompleted { node: "3".into() });
                Ok(JobOutput {
                    prompt_id: Some(format!("prompt-{name}")),
                    outputs: serde_json::json!({ "9": { "images": [format!("{name}.png")] } }),
                })
            }
            Script::Fail(err) => Err(err),
            Script::Hang { ack_interrupt: true } => {
                interrupted.cancelled().await;
                Err(BackendError::Interrupted)
            }
            Script::Hang {
                ack_interrupt: false,
            } => std::future::pending().await,
        }
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        self.record(Call::Interrupt);
        if let Some(token) = self.current_run.lock().unwrap().as_ref() {
            token.cancel();
        }
        Ok(())
    }

    async fn release_memory(&self) -> Result<bool, BackendError> {
        self.record(Call::Release);
        self.releases.lock().unwrap().pop_front().unwrap_or(Ok(true))
    }

    async fn vram_usage(&self) -> Option<VramUsage> {
        *self.vram.lock().unwrap()
    }
}

/// A request whose graph carries `name` so the mock can log it.
pub fn request(name: &str) -> GenerationRequest {
    GenerationRequest::new(serde_json::json!({ "name": name })).with_label(name)
}

/// Short timeouts so paused-clock tests stay readable.
pub fn test_config() -> QueueConfig {
    QueueConfig {
        cancel_timeout: Duration::from_secs(1),
        reclaim: ReclaimPolicy {
            max_attempts: 3,
            retry_delay: Duration::from_millis(50),
        },
        ..QueueConfig::default()
    }
}

/// Wait for the first event matching `pred`.
pub async fn next_matching<F>(rx: &mut broadcast::Receiver<QueueEvent>, pred: F) -> QueueEvent
where
    F: Fn(&QueueEvent) -> bool,
{
    loop {
        let event = rx.recv().await.expect("event bus closed");
        if pred(&event) {
            return event;
        }
    }
}
