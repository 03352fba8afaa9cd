//! Deadline and retry handling for dependency calls
//!
//! Every attempt runs under `tokio::time::timeout`; an expired attempt is
//! abandoned (the remote side may still finish its work). Between attempts the
//! loop sleeps for the next delay of the dependency's [`RetryPolicy`].

use super::{CallError, DependencyTimeoutError};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_retry::strategy::{jitter, ExponentialBackoff, FixedInterval};
use tracing::{debug, info, instrument, warn};

/// Delay schedule between attempts
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Doubling delays starting at `initial`, capped at `max`
    Exponential {
        /// First delay
        initial: Duration,
        /// Cap for any single delay
        max: Duration,
        /// Randomize each delay to spread retries of concurrent callers
        jitter: bool,
    },
    /// The same delay before every retry
    Fixed(Duration),
    /// Explicit escalating delays; the last one repeats when exhausted
    Schedule(Vec<Duration>),
}

impl Backoff {
    /// Delays to sleep before the 2nd, 3rd, ... attempt
    #[must_use]
    pub fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        match self {
            Self::Exponential {
                initial,
                max,
                jitter: with_jitter,
            } => {
                let initial_ms = u64::try_from(initial.as_millis()).unwrap_or(u64::MAX).max(1);
                // base^n * factor: 2*f, 4*f, 8*f, ...
                let strategy = ExponentialBackoff::from_millis(2)
                    .factor(initial_ms / 2 + initial_ms % 2)
                    .max_delay(*max);
                if *with_jitter {
                    Box::new(strategy.map(jitter))
                } else {
                    Box::new(strategy)
                }
            }
            Self::Fixed(delay) => Box::new(FixedInterval::new(*delay)),
            Self::Schedule(delays) => {
                let last = delays.last().copied().unwrap_or(Duration::ZERO);
                Box::new(delays.clone().into_iter().chain(std::iter::repeat(last)))
            }
        }
    }
}

/// Deadline and backoff applied to one dependency
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Deadline of a single attempt
    pub deadline: Duration,
    /// Wait between attempts
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Sub-second exponential backoff for calls a user is waiting on
    #[must_use]
    pub const fn interactive(deadline: Duration, initial: Duration, max: Duration) -> Self {
        Self {
            deadline,
            backoff: Backoff::Exponential {
                initial,
                max,
                jitter: true,
            },
        }
    }

    /// Fixed escalating schedule for background jobs (e.g. 60s, 120s, 300s)
    #[must_use]
    pub const fn background(deadline: Duration, schedule: Vec<Duration>) -> Self {
        Self {
            deadline,
            backoff: Backoff::Schedule(schedule),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::interactive(
            Duration::from_secs(10),
            Duration::from_millis(200),
            Duration::from_secs(2),
        )
    }
}

/// Result of one attempt, consumed by the retry loop
#[derive(Debug)]
pub enum AttemptOutcome<T, E> {
    /// The attempt finished successfully
    Ok(T),
    /// The attempt did not finish before the deadline
    Timeout,
    /// The attempt finished with an error
    Failed(E),
}

/// Successful call together with how it was reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome<T> {
    /// Returned value
    pub value: T,
    /// Attempt that succeeded, starting at 1
    pub attempt: u32,
    /// Total time including backoff sleeps
    pub elapsed: Duration,
}

/// Per-dependency call counters for `/metrics`
#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencyCallStats {
    /// Calls started
    pub calls: u64,
    /// Calls that eventually succeeded
    pub successes: u64,
    /// Calls that failed after exhausting attempts
    pub failures: u64,
    /// Attempts that ran into the deadline
    pub timeouts: u64,
    /// Attempts beyond the first
    pub retries: u64,
}

/// Runs dependency calls under deadlines with retries
#[derive(Debug)]
pub struct TimeoutManager {
    default_policy: RetryPolicy,
    policies: HashMap<String, RetryPolicy>,
    stats: Mutex<BTreeMap<String, DependencyCallStats>>,
}

impl TimeoutManager {
    /// Create a manager that applies `default_policy` to unknown dependencies
    #[must_use]
    pub fn new(default_policy: RetryPolicy) -> Self {
        Self {
            default_policy,
            policies: HashMap::new(),
            stats: Mutex::new(BTreeMap::new()),
        }
    }

    /// Builds the manager with policies for the inference and pricing APIs
    #[must_use]
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        let initial = Duration::from_millis(settings.retry_initial_backoff_ms);
        let max = Duration::from_millis(settings.retry_max_backoff_ms);
        Self::new(RetryPolicy::interactive(Duration::from_secs(10), initial, max))
            .with_policy(
                crate::config::DEEPSEEK,
                RetryPolicy::interactive(
                    Duration::from_millis(settings.deepseek_timeout_ms),
                    initial,
                    max,
                ),
            )
            .with_policy(
                crate::config::LARAVEL_API,
                RetryPolicy::interactive(
                    Duration::from_millis(settings.laravel_api_timeout_ms),
                    initial,
                    max,
                ),
            )
    }

    /// Overrides the policy of one dependency
    #[must_use]
    pub fn with_policy(mut self, dependency: impl Into<String>, policy: RetryPolicy) -> Self {
        self.policies.insert(dependency.into(), policy);
        self
    }

    /// Policy applied to `dependency`
    #[must_use]
    pub fn policy(&self, dependency: &str) -> &RetryPolicy {
        self.policies.get(dependency).unwrap_or(&self.default_policy)
    }

    /// Runs `operation` up to `max_attempts` times, each under the deadline
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Timeout`] when every attempt ran into the deadline,
    /// otherwise [`CallError::Failed`] carrying the most recent error.
    pub async fn execute_with_timeout<F, Fut, T, E>(
        &self,
        dependency: &str,
        max_attempts: u32,
        operation: F,
    ) -> Result<CallOutcome<T>, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let policy = self.policy(dependency).clone();
        self.execute_with_policy(dependency, &policy, max_attempts, operation)
            .await
    }

    /// Like [`Self::execute_with_timeout`] but with an explicit policy
    ///
    /// Used by background jobs that retry the same dependency on a slower
    /// schedule than interactive calls.
    ///
    /// # Errors
    ///
    /// Same as [`Self::execute_with_timeout`].
    #[instrument(skip(self, policy, operation), fields(deadline_ms = tracing::field::Empty))]
    pub async fn execute_with_policy<F, Fut, T, E>(
        &self,
        dependency: &str,
        policy: &RetryPolicy,
        max_attempts: u32,
        mut operation: F,
    ) -> Result<CallOutcome<T>, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let max_attempts = max_attempts.max(1);
        let started = Instant::now();
        let mut delays = policy.backoff.delays();
        let mut last_error: Option<E> = None;
        tracing::Span::current().record("deadline_ms", policy.deadline.as_millis());
        self.record(dependency, |s| s.calls += 1);

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = delays.next().unwrap_or(Duration::ZERO);
                debug!(dependency, attempt, delay_ms = delay.as_millis(), "Backing off before retry");
                tokio::time::sleep(delay).await;
                self.record(dependency, |s| s.retries += 1);
            }

            match Self::attempt(policy.deadline, operation()).await {
                AttemptOutcome::Ok(value) => {
                    if attempt > 1 {
                        info!(dependency, attempt, "Dependency call succeeded after retry");
                    }
                    self.record(dependency, |s| s.successes += 1);
                    return Ok(CallOutcome {
                        value,
                        attempt,
                        elapsed: started.elapsed(),
                    });
                }
                AttemptOutcome::Timeout => {
                    self.record(dependency, |s| s.timeouts += 1);
                    warn!(
                        dependency,
                        attempt,
                        max_attempts,
                        deadline_ms = policy.deadline.as_millis(),
                        "Dependency call timed out"
                    );
                }
                AttemptOutcome::Failed(e) => {
                    warn!(dependency, attempt, max_attempts, error = %e, "Dependency call failed");
                    last_error = Some(e);
                }
            }
        }

        self.record(dependency, |s| s.failures += 1);
        Err(match last_error {
            Some(source) => CallError::Failed {
                dependency: dependency.to_string(),
                attempts: max_attempts,
                source,
            },
            None => CallError::Timeout(DependencyTimeoutError {
                dependency: dependency.to_string(),
                attempts: max_attempts,
                deadline: policy.deadline,
            }),
        })
    }

    async fn attempt<Fut, T, E>(deadline: Duration, call: Fut) -> AttemptOutcome<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        match tokio::time::timeout(deadline, call).await {
            Ok(Ok(value)) => AttemptOutcome::Ok(value),
            Ok(Err(e)) => AttemptOutcome::Failed(e),
            Err(_elapsed) => AttemptOutcome::Timeout,
        }
    }

    fn record(&self, dependency: &str, update: impl FnOnce(&mut DependencyCallStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        update(stats.entry(dependency.to_string()).or_default());
    }

    /// Call counters per dependency
    #[must_use]
    pub fn stats(&self) -> BTreeMap<String, DependencyCallStats> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("upstream said no")]
    struct Upstream;

    fn manager(deadline: Duration) -> TimeoutManager {
        TimeoutManager::new(RetryPolicy {
            deadline,
            backoff: Backoff::Fixed(Duration::from_millis(100)),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_attempt_success_reports_attempt_two() {
        let tm = manager(Duration::from_secs(1));
        let calls = AtomicU32::new(0);
        let outcome = tm
            .execute_with_timeout("deepseek", 2, || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Upstream)
                } else {
                    Ok("respuesta")
                }
            })
            .await
            .expect("second attempt succeeds");
        assert_eq!(outcome.value, "respuesta");
        assert_eq!(outcome.attempt, 2);
        let stats = tm.stats();
        assert_eq!(stats["deepseek"].retries, 1);
        assert_eq!(stats["deepseek"].successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_attempts_time_out() {
        let tm = manager(Duration::from_millis(50));
        let result = tm
            .execute_with_timeout("laravel_api", 3, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, Upstream>(())
            })
            .await;
        match result {
            Err(CallError::Timeout(e)) => {
                assert_eq!(e.attempts, 3);
                assert_eq!(e.dependency, "laravel_api");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(tm.stats()["laravel_api"].timeouts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_return_underlying_error() {
        let tm = manager(Duration::from_secs(1));
        let calls = AtomicU32::new(0);
        let result = tm
            .execute_with_timeout("deepseek", 3, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Upstream)
            })
            .await;
        assert!(matches!(result, Err(CallError::Failed { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_schedule_repeats_last_delay() {
        let backoff = Backoff::Schedule(vec![
            Duration::from_secs(60),
            Duration::from_secs(120),
            Duration::from_secs(300),
        ]);
        let delays: Vec<_> = backoff.delays().take(4).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(300),
                Duration::from_secs(300)
            ]
        );
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(200),
            max: Duration::from_millis(500),
            jitter: false,
        };
        let delays: Vec<_> = backoff.delays().take(3).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500)
            ]
        );
    }
}
