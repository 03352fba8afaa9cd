//! Resilience primitives for external dependencies
//!
//! Circuit breakers, deadline/retry handling and the global degradation level.
//! Calls to the inference and pricing APIs go through a [`DependencyGuard`],
//! which puts a [`TimeoutManager`] retry loop behind a [`CircuitBreaker`].

pub mod circuit_breaker;
pub mod degradation;
pub mod guard;
pub mod registry;
pub mod timeout;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use degradation::{
    DegradationLevel, DegradationManager, DegradationPolicy, Feature, FeatureFlags, HealthSnapshot,
};
pub use guard::DependencyGuard;
pub use registry::CircuitRegistry;
pub use timeout::{AttemptOutcome, Backoff, CallOutcome, RetryPolicy, TimeoutManager};

use std::time::Duration;
use thiserror::Error;

/// A call was rejected without being attempted because its circuit is open
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit '{dependency}' is open, retry after {retry_after:?}")]
pub struct CircuitOpenError {
    /// Dependency whose circuit rejected the call
    pub dependency: String,
    /// Time left until the breaker accepts a probe
    pub retry_after: Duration,
}

/// No attempt of a dependency call finished before its deadline
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("dependency '{dependency}' timed out after {attempts} attempt(s) (deadline {deadline:?})")]
pub struct DependencyTimeoutError {
    /// Dependency that timed out
    pub dependency: String,
    /// Attempts made before giving up
    pub attempts: u32,
    /// Per-attempt deadline
    pub deadline: Duration,
}

/// Failure of a guarded dependency call
#[derive(Debug, Error)]
pub enum CallError<E>
where
    E: std::error::Error + 'static,
{
    /// Rejected by an open circuit, nothing was attempted
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
    /// Every attempt ran into the deadline
    #[error(transparent)]
    Timeout(#[from] DependencyTimeoutError),
    /// The dependency returned an error on the final attempt
    #[error("dependency '{dependency}' failed after {attempts} attempt(s): {source}")]
    Failed {
        /// Dependency that failed
        dependency: String,
        /// Attempts made before giving up
        attempts: u32,
        /// Error of the last attempt
        #[source]
        source: E,
    },
}

impl<E> CallError<E>
where
    E: std::error::Error + 'static,
{
    /// Returns true for the fast-fail signal of an open circuit
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }

    /// Name of the dependency the error belongs to
    #[must_use]
    pub fn dependency(&self) -> &str {
        match self {
            Self::CircuitOpen(e) => &e.dependency,
            Self::Timeout(e) => &e.dependency,
            Self::Failed { dependency, .. } => dependency,
        }
    }
}
