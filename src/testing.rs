//! Testing helpers and mock utilities.
//!
//! Provides convenient constructors for guards, monitors and mocked stores.

use crate::monitor::PerformanceMonitor;
use crate::resilience::{Backoff, CircuitBreaker, DependencyGuard, RetryPolicy, TimeoutManager};
use crate::session::{MockSessionStore, StoreError};
use std::sync::Arc;
use std::time::Duration;

/// Guard with a 1s deadline and 1ms fixed backoff, threshold 5, cooldown 60s.
#[must_use]
pub fn fast_guard(dependency: &str, max_attempts: u32) -> DependencyGuard {
    let breaker = Arc::new(CircuitBreaker::for_dependency(
        dependency,
        5,
        Duration::from_secs(60),
    ));
    let timeouts = Arc::new(TimeoutManager::new(RetryPolicy {
        deadline: Duration::from_secs(1),
        backoff: Backoff::Fixed(Duration::from_millis(1)),
    }));
    DependencyGuard::new(breaker, timeouts, max_attempts)
}

/// Monitor with a 2s slow threshold.
#[must_use]
pub fn test_monitor() -> Arc<PerformanceMonitor> {
    Arc::new(PerformanceMonitor::new(
        Duration::from_secs(2),
        Duration::from_secs(60),
        1_000,
    ))
}

/// Create a mock session store whose every operation fails.
///
/// Useful to exercise the ephemeral-session path.
#[must_use]
pub fn mock_store_unavailable() -> MockSessionStore {
    let down = || StoreError::Backend("connection refused".to_string());
    let mut mock = MockSessionStore::new();
    mock.expect_load().returning(move |_| Err(down()));
    mock.expect_store().returning(move |_| Err(down()));
    mock.expect_count().returning(move || Err(down()));
    mock.expect_ping().returning(move || Err(down()));
    mock.expect_backend().return_const("mock");
    mock
}
