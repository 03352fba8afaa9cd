//! Per-dependency circuit breaker
//!
//! ```text
//! CLOSED ──failure_threshold failures──▶ OPEN
//! OPEN ──cooldown elapsed──▶ HALF_OPEN (one probe)
//! HALF_OPEN ──probe ok──▶ CLOSED
//! HALF_OPEN ──probe failed──▶ OPEN (cooldown restarts)
//! ```
//!
//! The record lives behind a `std::sync::Mutex` so that a probe permit can
//! give its slot back from `Drop` when the caller's future is cancelled.

use super::CircuitOpenError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Externally visible breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls fail fast
    Open,
    /// A single probe call decides between CLOSED and OPEN
    HalfOpen,
}

impl CircuitState {
    /// Upper-case name used in logs and operational endpoints
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Thresholds of one breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within `failure_window` that open the circuit
    pub failure_threshold: u32,
    /// Time spent OPEN before a probe is allowed
    pub cooldown: Duration,
    /// Failures older than this are forgotten
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            failure_window: Duration::from_secs(120),
        }
    }
}

#[derive(Debug)]
struct CircuitRecord {
    state: CircuitState,
    /// Instants of the failures still inside the window, oldest first
    recent_failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_probe_in_flight: bool,
    last_failure_wall: Option<DateTime<Utc>>,
    opened_at_wall: Option<DateTime<Utc>>,
    total_calls: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl CircuitRecord {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            recent_failures: VecDeque::new(),
            opened_at: None,
            half_open_probe_in_flight: false,
            last_failure_wall: None,
            opened_at_wall: None,
            total_calls: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }

    fn failure_count(&self) -> u32 {
        u32::try_from(self.recent_failures.len()).unwrap_or(u32::MAX)
    }

    /// Records a failure at `now` and drops those older than `window`
    fn push_failure(&mut self, now: Instant, window: Duration) -> u32 {
        while self
            .recent_failures
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) > window)
        {
            self.recent_failures.pop_front();
        }
        self.recent_failures.push_back(now);
        self.failure_count()
    }
}

/// Point-in-time view of a breaker, as reported by `/circuits`
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    /// Dependency name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Failures counted towards the threshold
    pub failures: u32,
    /// Configured threshold
    pub failure_threshold: u32,
    /// Configured cooldown in seconds
    pub cooldown_secs: u64,
    /// Whether a half-open probe is running
    pub probe_in_flight: bool,
    /// Wall-clock time of the last failure
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Wall-clock time the circuit last opened
    pub opened_at: Option<DateTime<Utc>>,
    /// Calls that were let through
    pub total_calls: u64,
    /// Calls that failed
    pub total_failures: u64,
    /// Calls rejected without being attempted
    pub rejected_calls: u64,
}

/// Circuit breaker guarding one external dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    record: Mutex<CircuitRecord>,
}

impl CircuitBreaker {
    /// Create a breaker with explicit configuration
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            record: Mutex::new(CircuitRecord::new()),
        }
    }

    /// Named constructor for a dependency with its own tolerance
    #[must_use]
    pub fn for_dependency(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self::new(
            name,
            CircuitBreakerConfig {
                failure_threshold: failure_threshold.max(1),
                cooldown,
                ..CircuitBreakerConfig::default()
            },
        )
    }

    /// Breaker for the inference API
    #[must_use]
    pub fn deepseek(settings: &crate::config::Settings) -> Self {
        Self::new(
            crate::config::DEEPSEEK,
            CircuitBreakerConfig {
                failure_threshold: settings.deepseek_failure_threshold.max(1),
                cooldown: Duration::from_secs(settings.deepseek_cooldown_secs),
                failure_window: Duration::from_secs(settings.circuit_failure_window_secs),
            },
        )
    }

    /// Breaker for the pricing/alerts API
    #[must_use]
    pub fn laravel_api(settings: &crate::config::Settings) -> Self {
        Self::new(
            crate::config::LARAVEL_API,
            CircuitBreakerConfig {
                failure_threshold: settings.laravel_api_failure_threshold.max(1),
                cooldown: Duration::from_secs(settings.laravel_api_cooldown_secs),
                failure_window: Duration::from_secs(settings.circuit_failure_window_secs),
            },
        )
    }

    /// Dependency name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CircuitRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves OPEN to HALF_OPEN once the cooldown has elapsed
    fn refresh(&self, record: &mut CircuitRecord, now: Instant) {
        if record.state != CircuitState::Open {
            return;
        }
        let cooled_down = record
            .opened_at
            .is_none_or(|opened| now.saturating_duration_since(opened) >= self.config.cooldown);
        if cooled_down {
            record.state = CircuitState::HalfOpen;
            record.half_open_probe_in_flight = false;
            info!(circuit = %self.name, "Circuit cooldown elapsed, moving to HALF_OPEN");
        }
    }

    fn retry_after(&self, record: &CircuitRecord, now: Instant) -> Duration {
        record.opened_at.map_or(Duration::ZERO, |opened| {
            self.config
                .cooldown
                .saturating_sub(now.saturating_duration_since(opened))
        })
    }

    /// Current state, applying a due OPEN → HALF_OPEN transition
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut record = self.lock();
        self.refresh(&mut record, Instant::now());
        record.state
    }

    /// Failures currently counted towards the threshold
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count()
    }

    /// Clears the record back to CLOSED with no failures
    pub fn reset(&self) {
        let mut record = self.lock();
        let totals = (record.total_calls, record.total_failures, record.total_rejections);
        *record = CircuitRecord::new();
        (record.total_calls, record.total_failures, record.total_rejections) = totals;
        info!(circuit = %self.name, "Circuit reset to CLOSED");
    }

    /// Runs `operation` unless the circuit rejects it
    ///
    /// Any `Err` returned by the operation counts as one failure.
    ///
    /// # Errors
    ///
    /// Returns [`Rejected::Open`] when the call was not attempted, or
    /// [`Rejected::Inner`] with the operation's own error.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, Rejected<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().map_err(Rejected::Open)?;
        match operation().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(e) => {
                permit.fail();
                Err(Rejected::Inner(e))
            }
        }
    }

    /// Asks for permission to make one call
    ///
    /// # Errors
    ///
    /// Returns [`CircuitOpenError`] when OPEN or while a half-open probe runs.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpenError> {
        let now = Instant::now();
        let mut record = self.lock();
        self.refresh(&mut record, now);

        let probe = match record.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if !record.half_open_probe_in_flight => {
                record.half_open_probe_in_flight = true;
                debug!(circuit = %self.name, "Half-open probe admitted");
                true
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                record.total_rejections += 1;
                let rejections = record.total_rejections;
                if rejections.is_multiple_of(100) {
                    debug!(circuit = %self.name, rejections, "Circuit is rejecting calls");
                }
                return Err(CircuitOpenError {
                    dependency: self.name.clone(),
                    retry_after: self.retry_after(&record, now),
                });
            }
        };
        record.total_calls += 1;
        Ok(CallPermit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    fn on_success(&self, probe: bool) {
        let mut record = self.lock();
        if probe {
            record.half_open_probe_in_flight = false;
        }
        match record.state {
            CircuitState::HalfOpen if probe => {
                record.state = CircuitState::Closed;
                record.recent_failures.clear();
                record.opened_at = None;
                info!(circuit = %self.name, "Probe succeeded, circuit CLOSED");
            }
            CircuitState::Closed => record.recent_failures.clear(),
            _ => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        let now = Instant::now();
        let mut record = self.lock();
        record.total_failures += 1;
        record.last_failure_wall = Some(Utc::now());
        if probe {
            record.half_open_probe_in_flight = false;
        }

        match record.state {
            CircuitState::HalfOpen if probe => {
                self.open(&mut record, now);
                warn!(circuit = %self.name, "Probe failed, circuit re-OPENED");
            }
            CircuitState::Closed => {
                let failures = record.push_failure(now, self.config.failure_window);
                if failures >= self.config.failure_threshold {
                    self.open(&mut record, now);
                    warn!(
                        circuit = %self.name,
                        failures,
                        cooldown_secs = self.config.cooldown.as_secs(),
                        "Failure threshold reached, circuit OPEN"
                    );
                }
            }
            _ => {}
        }
    }

    fn open(&self, record: &mut CircuitRecord, now: Instant) {
        record.state = CircuitState::Open;
        record.opened_at = Some(now);
        record.opened_at_wall = Some(Utc::now());
        record.half_open_probe_in_flight = false;
    }

    fn on_abandoned(&self, probe: bool) {
        if probe {
            let mut record = self.lock();
            record.half_open_probe_in_flight = false;
            debug!(circuit = %self.name, "Half-open probe abandoned");
        }
    }

    /// Snapshot for operational endpoints
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut record = self.lock();
        self.refresh(&mut record, Instant::now());
        CircuitSnapshot {
            name: self.name.clone(),
            state: record.state,
            failures: record.failure_count(),
            failure_threshold: self.config.failure_threshold,
            cooldown_secs: self.config.cooldown.as_secs(),
            probe_in_flight: record.half_open_probe_in_flight,
            last_failure_at: record.last_failure_wall,
            opened_at: record.opened_at_wall,
            total_calls: record.total_calls,
            total_failures: record.total_failures,
            rejected_calls: record.total_rejections,
        }
    }
}

/// Outcome of [`CircuitBreaker::execute`] when the call did not succeed
#[derive(Debug)]
pub enum Rejected<E> {
    /// The breaker did not let the call through
    Open(CircuitOpenError),
    /// The call ran and failed
    Inner(E),
}

/// Permission for one call; report the outcome with `succeed` or `fail`
///
/// Dropping an unsettled permit releases a half-open probe slot without
/// recording an outcome.
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl CallPermit<'_> {
    /// Whether this permit is the half-open probe
    #[must_use]
    pub const fn is_probe(&self) -> bool {
        self.probe
    }

    /// Records a successful call
    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    /// Records a failed call
    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandoned(self.probe);
        }
    }
}
