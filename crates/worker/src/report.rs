//! Console reporting for the worker binary: live event logging and the
//! end-of-run summary.

use std::fmt::Write as _;

use switchgen_core::job::{Job, JobStatus};
use switchgen_events::QueueEvent;
use switchgen_queue::HealthReport;
use tokio::sync::broadcast;

/// Log every queue event until the bus closes.
pub async fn log_events(mut rx: broadcast::Receiver<QueueEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => log_event(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event logger lagged behind the queue");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &QueueEvent) {
    match event {
        QueueEvent::JobProgress {
            job_id, progress, ..
        } => {
            tracing::info!(
                job_id = %job_id,
                node = progress.current_node.as_deref().unwrap_or("-"),
                step = progress.current_step,
                total = progress.total_steps,
                percent = progress.percent(),
                "Progress",
            );
        }
        QueueEvent::HealthWarning { warning, .. } => {
            tracing::warn!(warning = %warning, "Health warning");
        }
        other => {
            tracing::debug!(
                event = other.event_type(),
                job_id = ?other.job_id(),
                "Queue event",
            );
        }
    }
}

/// Render a one-line-per-job summary followed by totals and health.
pub fn summary(jobs: &[Job], health: &HealthReport) -> String {
    let mut out = String::new();
    let mut counts = [0usize; 3];

    for job in jobs {
        let label = job.request.label.as_deref().unwrap_or("-");
        let elapsed = match (job.started_at, job.finished_at) {
            (Some(start), Some(end)) => {
                format!("{:.1}s", (end - start).num_milliseconds() as f64 / 1000.0)
            }
            _ => "-".to_string(),
        };
        let detail = match job.status {
            JobStatus::Failed => job.error.as_ref().map(ToString::to_string),
            JobStatus::Cancelled if job.cancel_forced => Some("forced after timeout".into()),
            _ => None,
        };
        match job.status {
            JobStatus::Completed => counts[0] += 1,
            JobStatus::Failed => counts[1] += 1,
            JobStatus::Cancelled => counts[2] += 1,
            _ => {}
        }

        let _ = write!(out, "{:<24} {:<10} {:>8}", label, job.status.as_str(), elapsed);
        if let Some(detail) = detail {
            let _ = write!(out, "  {detail}");
        }
        out.push('\n');
    }

    let _ = writeln!(
        out,
        "{} completed, {} failed, {} cancelled",
        counts[0], counts[1], counts[2]
    );
    if health.is_degraded() {
        let _ = writeln!(
            out,
            "warning: GPU memory degraded ({} consecutive reclaim failures, VRAM level {})",
            health.consecutive_reclaim_failures,
            health
                .vram_level
                .map_or_else(|| "unknown".to_string(), |l| format!("{l:?}").to_lowercase()),
        );
    }
    out
}
