//! Domain types shared by every SwitchGen crate.
//!
//! Zero internal dependencies: the job record and its state machine,
//! the execution backend contract, VRAM thresholds and warning types.

pub mod backend;
pub mod error;
pub mod job;
pub mod job_events;
pub mod types;
pub mod vram;
pub mod warning;
