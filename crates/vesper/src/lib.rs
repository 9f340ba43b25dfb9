//! Vesper - Configuration-driven script dispatch and scheduling
//!
//! This crate provides the core engine:
//! - Handlers compiled from configuration fragments
//! - Dispatchers that run their bound handlers in priority order
//! - Schedule tasks with one-shot and periodic fire times
//! - Hot reload of the backing configuration files

pub use vesper_script;

// Shared compile lifecycle
pub mod compiler;

// Handlers and dispatchers
pub mod dispatch;

// Scheduled executions
pub mod schedule;

// Configuration loading, diffing and watching
pub mod project;

// Top-level wiring
mod runtime;

pub use runtime::*;
