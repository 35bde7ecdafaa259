use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use switchgen_comfyui::ComfyUIBackend;
use switchgen_core::job::JobStatus;
use switchgen_queue::GenerationService;
use switchgen_worker::config::WorkerConfig;
use switchgen_worker::{report, workflow};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "switchgen_worker=info,switchgen_queue=info,switchgen_comfyui=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let paths: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        anyhow::bail!("usage: switchgen-worker <workflow.json>...");
    }

    let config = WorkerConfig::from_env().context("Invalid configuration")?;

    // Load everything up front so a bad file does not strand earlier jobs.
    let requests = paths
        .iter()
        .map(|path| {
            workflow::load_request(path)
                .with_context(|| format!("Failed to load workflow {}", path.display()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    tracing::info!(
        comfyui_url = %config.comfyui_url,
        workflows = requests.len(),
        "Worker starting",
    );

    let backend = Arc::new(
        ComfyUIBackend::new(&config.comfyui_url, config.comfyui_ws_url.as_deref())
            .with_release_tolerance(config.release_tolerance_bytes),
    );
    let (service, worker) = GenerationService::start(backend.clone(), config.queue.clone())?;

    let logger = tokio::spawn(report::log_events(service.subscribe()));
    let interrupts = tokio::spawn(handle_interrupts(service.clone()));

    let mut ids = Vec::with_capacity(requests.len());
    for request in requests {
        ids.push(service.submit(request)?);
    }

    let mut finished = Vec::with_capacity(ids.len());
    for id in ids {
        match service.wait_for(id).await {
            Ok(job) => finished.push(job),
            Err(e) => tracing::warn!(job_id = %id, error = %e, "Job did not finish"),
        }
    }

    service.shutdown();
    backend.close();
    worker.await.context("Worker task panicked")?;
    interrupts.abort();
    logger.abort();

    print!("{}", report::summary(&finished, &service.health()));

    let failed = finished
        .iter()
        .filter(|job| job.status == JobStatus::Failed)
        .count();
    if failed > 0 {
        anyhow::bail!("{failed} job(s) failed");
    }
    Ok(())
}

/// Route interrupt signals to cooperative cancellation.
///
/// The first Ctrl-C cancels the running job and lets the rest of the
/// queue proceed. The next one also shuts the queue down. SIGTERM (on
/// Unix) does both at once.
async fn handle_interrupts(service: GenerationService) {
    #[cfg(unix)]
    let mut terminate =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                None
            }
        };

    let mut presses = 0u32;
    loop {
        #[cfg(unix)]
        let term = async {
            match terminate.as_mut() {
                Some(signal) => {
                    signal.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let term = std::future::pending::<()>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                    return;
                }
                presses += 1;
                let cancelled = service.cancel_current();
                if presses == 1 {
                    tracing::info!(
                        job_id = ?cancelled,
                        "Received Ctrl-C, cancelling current job (press again to stop the queue)",
                    );
                } else {
                    tracing::info!(job_id = ?cancelled, "Received Ctrl-C again, shutting down");
                    service.shutdown();
                    return;
                }
            }
            () = term => {
                tracing::info!("Received SIGTERM, cancelling current job and shutting down");
                service.cancel_current();
                service.shutdown();
                return;
            }
        }
    }
}
