//! Library half of the `switchgen-worker` binary.
//!
//! Split out so configuration, workflow loading and reporting can be
//! unit tested without starting the process.

pub mod config;
pub mod report;
pub mod workflow;
