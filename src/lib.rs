//! A concurrent test-execution engine.
//!
//! Test files are discovered, registered on one worker pool and executed on
//! another, with tag filtering, per-file snapshot stores, plugin lifecycle
//! hooks, and fail-fast or interrupt-driven cancellation.

pub mod cli;
pub mod emit;
pub mod plugin;
pub mod runner;
pub mod snapshot;
pub mod suite;

pub use runner::config::RunConfig;
pub use runner::context::RunContext;
pub use runner::executor::{RunError, TestRunner, run};
