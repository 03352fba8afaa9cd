#![deny(missing_docs)]
//! FuelWatch gateway library.
//!
//! Resilience, admission control and session coordination behind the fuel
//! price bot: circuit breakers and deadlines for the inference and pricing
//! APIs, degradation levels, per-user sessions and the ops endpoints.

/// HTTP clients for the inference and pricing APIs.
pub mod clients;
/// Admission control for active conversations.
pub mod concurrency;
/// Configuration management.
pub mod config;
/// Message pipeline, command handlers and worker pool.
pub mod gateway;
/// Command latency and memory tracking.
pub mod monitor;
/// Ops HTTP endpoints.
pub mod ops;
/// Circuit breakers, timeouts and degradation.
pub mod resilience;
/// Session persistence.
pub mod session;

/// Shared constructors for unit tests.
#[cfg(test)]
pub mod testing;
