//! devstack starts, stops and inspects local development environments made of
//! several long-running services. Services are declared in a YAML file together
//! with their ports, health endpoints and dependencies; composites group them
//! into environments that start in dependency order and roll back on failure.

/// Cooperative cancellation.
pub mod cancel;

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Constants and tuning defaults.
pub mod constants;

/// Error handling.
pub mod error;

/// Readiness probes.
pub mod health;

/// Per-service log sinks.
pub mod logs;

/// Composite start, stop, status and restart.
pub mod orchestrator;

/// Process spawning and termination.
pub mod process;

/// Human-readable output.
pub mod report;

/// Startup ordering.
pub mod resolver;

/// Single-service lifecycle control.
pub mod service;

#[cfg(test)]
mod test_utils;
