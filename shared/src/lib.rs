//! Shared data structures and utilities for the pulse latency monitor
//!
//! This crate contains common types, configuration structures, the IPC wire
//! protocol, and path resolution used by both the daemon and the terminal
//! front end.

pub mod config;
pub mod defaults;
pub mod duration;
pub mod ipc;
pub mod metrics;
pub mod paths;

// Re-export commonly used types for convenience
pub use config::{Aggregation, Config, ProbeKind, Target};
pub use metrics::{BurstResult, DataPoint, Stats};

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the latency monitor
#[derive(Debug, thiserror::Error)]
pub enum PulseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests;
