//! ComfyUI execution backend.
//!
//! Speaks the ComfyUI HTTP and WebSocket APIs so a ComfyUI server can sit
//! behind the queue's [`ExecutionBackend`] seam.
//!
//! [`ExecutionBackend`]: switchgen_core::backend::ExecutionBackend

pub mod api;
pub mod backend;
pub mod client;
pub mod messages;
pub mod reconnect;
pub mod tracker;

pub use backend::ComfyUIBackend;
