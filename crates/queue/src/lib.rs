//! Single-worker generation queue.
//!
//! Sits between request sources and a stateful, single-GPU
//! [`ExecutionBackend`]: jobs are admitted into a FIFO [`JobQueue`],
//! executed strictly one at a time by the [`Worker`], cancelled
//! cooperatively through the [`CancellationController`], and every
//! dequeue is paired with exactly one [`ResourceReclaimer::reclaim`]
//! call so GPU memory never leaks from one job into the next.
//!
//! Callers normally use the [`GenerationService`] facade.
//!
//! [`ExecutionBackend`]: switchgen_core::backend::ExecutionBackend

pub mod cancel;
pub mod config;
pub mod error;
pub mod health;
pub mod queue;
pub mod reclaim;
pub mod service;
pub mod worker;

pub use cancel::CancellationController;
pub use config::QueueConfig;
pub use error::{ConfigError, QueueError};
pub use health::{HealthMonitor, HealthReport};
pub use queue::{JobOutcome, JobQueue};
pub use reclaim::{ReclaimPolicy, ReclaimResult, ResourceReclaimer};
pub use service::GenerationService;
pub use worker::Worker;
