//! SwitchGen event bus.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`QueueEvent`]: lifecycle, progress and health notifications
//!   published by the queue and its worker.

pub mod bus;

pub use bus::{EventBus, QueueEvent};
