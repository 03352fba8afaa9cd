//! Breaker + deadline composition for one dependency
//!
//! The timeout manager retries locally; only an exhausted call reaches the
//! breaker as a single failure. An open circuit short-circuits before any
//! attempt is made.

use super::circuit_breaker::{CircuitBreaker, Rejected};
use super::timeout::{CallOutcome, RetryPolicy, TimeoutManager};
use super::CallError;
use std::future::Future;
use std::sync::Arc;

/// Guarded access path to one external dependency
#[derive(Debug, Clone)]
pub struct DependencyGuard {
    breaker: Arc<CircuitBreaker>,
    timeouts: Arc<TimeoutManager>,
    max_attempts: u32,
}

impl DependencyGuard {
    /// Create a guard; the dependency name is taken from the breaker
    #[must_use]
    pub fn new(breaker: Arc<CircuitBreaker>, timeouts: Arc<TimeoutManager>, max_attempts: u32) -> Self {
        Self {
            breaker,
            timeouts,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Dependency name
    #[must_use]
    pub fn name(&self) -> &str {
        self.breaker.name()
    }

    /// Breaker of this dependency
    #[must_use]
    pub const fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Runs `operation` behind the breaker with deadlines and retries
    ///
    /// # Errors
    ///
    /// Returns [`CallError::CircuitOpen`] without calling `operation` when the
    /// circuit rejects the call, otherwise the timeout manager's error.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<CallOutcome<T>, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let name = self.breaker.name();
        let result = self
            .breaker
            .execute(|| {
                self.timeouts
                    .execute_with_timeout(name, self.max_attempts, operation)
            })
            .await;
        Self::flatten(result)
    }

    /// Like [`Self::call`] with an explicit retry policy and attempt budget
    ///
    /// # Errors
    ///
    /// Same as [`Self::call`].
    pub async fn call_with_policy<F, Fut, T, E>(
        &self,
        policy: &RetryPolicy,
        max_attempts: u32,
        operation: F,
    ) -> Result<CallOutcome<T>, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let name = self.breaker.name();
        let result = self
            .breaker
            .execute(|| {
                self.timeouts
                    .execute_with_policy(name, policy, max_attempts, operation)
            })
            .await;
        Self::flatten(result)
    }

    fn flatten<T, E>(
        result: Result<CallOutcome<T>, Rejected<CallError<E>>>,
    ) -> Result<CallOutcome<T>, CallError<E>>
    where
        E: std::error::Error + 'static,
    {
        match result {
            Ok(outcome) => Ok(outcome),
            Err(Rejected::Open(open)) => Err(CallError::CircuitOpen(open)),
            Err(Rejected::Inner(e)) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{Backoff, CircuitState};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    #[error("bad gateway")]
    struct BadGateway;

    fn guard(threshold: u32, attempts: u32) -> DependencyGuard {
        let breaker = Arc::new(CircuitBreaker::for_dependency(
            "deepseek",
            threshold,
            Duration::from_secs(60),
        ));
        let timeouts = Arc::new(TimeoutManager::new(RetryPolicy {
            deadline: Duration::from_millis(100),
            backoff: Backoff::Fixed(Duration::from_millis(10)),
        }));
        DependencyGuard::new(breaker, timeouts, attempts)
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_count_as_one_failure() {
        let guard = guard(2, 3);
        let calls = AtomicU32::new(0);
        let result = guard
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(BadGateway)
            })
            .await;
        assert!(matches!(result, Err(CallError::Failed { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(guard.breaker().failure_count(), 1);
        assert_eq!(guard.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_open_circuit_then_fast_fail() {
        let guard = guard(1, 2);
        let slow = || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, BadGateway>(())
        };
        let first = guard.call(slow).await;
        assert!(matches!(first, Err(CallError::Timeout(_))));
        assert_eq!(guard.breaker().state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let second = guard
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BadGateway>(())
            })
            .await;
        assert!(second.as_ref().is_err_and(CallError::is_circuit_open));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_schedule_waits_between_attempts() {
        let guard = guard(5, 1);
        let policy = RetryPolicy::background(
            Duration::from_secs(5),
            vec![Duration::from_secs(60), Duration::from_secs(120)],
        );
        let calls = AtomicU32::new(0);
        let outcome = guard
            .call_with_policy(&policy, 3, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BadGateway)
                } else {
                    Ok("alerta creada")
                }
            })
            .await
            .expect("third attempt succeeds");
        assert_eq!(outcome.attempt, 3);
        assert!(outcome.elapsed >= Duration::from_secs(180));
    }
}
