//! Command latency and memory tracking
//!
//! Timers live in a bounded moka cache so a handler that never ends its
//! timer cannot leak memory; per-command statistics are kept incrementally
//! as running count and sum.

use moka::future::Cache;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifier returned by [`PerformanceMonitor::start_timer`]
pub type TimerId = Uuid;

#[derive(Debug, Clone)]
struct ActiveTimer {
    command: String,
    user_id: i64,
    started_at: Instant,
    memory_at_start: u64,
}

/// One finished command measurement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricSample {
    /// Command name
    pub command: String,
    /// User that issued the command
    pub user_id: i64,
    /// Wall time between start and end of the timer
    pub response_time_ms: u64,
    /// Resident memory of the process when the timer ended
    pub memory_usage_bytes: u64,
    /// Change of resident memory while the timer ran
    pub memory_delta_bytes: i64,
}

/// Running statistics of one command
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommandStats {
    /// Finished executions
    pub total_executions: u64,
    /// Sum of all response times
    pub total_response_time_ms: u64,
    /// Mean response time
    pub avg_response_time_ms: f64,
    /// Fastest execution
    pub min_response_time_ms: u64,
    /// Slowest execution
    pub max_response_time_ms: u64,
    /// Executions above the slow-command threshold
    pub slow_executions: u64,
    /// Resident memory reported by the latest execution
    pub last_memory_usage_bytes: u64,
}

impl CommandStats {
    fn record(&mut self, response_time_ms: u64, memory_bytes: u64, slow: bool) {
        self.min_response_time_ms = if self.total_executions == 0 {
            response_time_ms
        } else {
            self.min_response_time_ms.min(response_time_ms)
        };
        self.max_response_time_ms = self.max_response_time_ms.max(response_time_ms);
        self.total_executions += 1;
        self.total_response_time_ms = self.total_response_time_ms.saturating_add(response_time_ms);
        #[allow(clippy::cast_precision_loss)]
        {
            self.avg_response_time_ms =
                self.total_response_time_ms as f64 / self.total_executions as f64;
        }
        if slow {
            self.slow_executions += 1;
        }
        self.last_memory_usage_bytes = memory_bytes;
    }
}

/// Process and host memory for `/metrics`
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceSnapshot {
    /// Resident memory of this process
    pub process_memory_bytes: u64,
    /// Memory in use on the host
    pub system_used_memory_bytes: u64,
    /// Total memory of the host
    pub system_total_memory_bytes: u64,
    /// Timers started but not yet ended
    pub active_timers: u64,
}

/// Reads resident memory of the current process
pub struct MemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl MemoryProbe {
    /// Create a probe for the current process
    #[must_use]
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = e, "Cannot resolve own pid, memory will be reported as 0");
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }

    /// Resident memory of this process in bytes
    #[must_use]
    pub fn process_memory(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            ProcessRefreshKind::new().with_memory(),
        );
        system.process(pid).map_or(0, sysinfo::Process::memory)
    }

    /// Used and total memory of the host in bytes
    #[must_use]
    pub fn system_memory(&self) -> (u64, u64) {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        (system.used_memory(), system.total_memory())
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency and memory tracker for handled commands
pub struct PerformanceMonitor {
    active: Cache<TimerId, ActiveTimer>,
    stats: Mutex<BTreeMap<String, CommandStats>>,
    probe: MemoryProbe,
    slow_threshold: Duration,
}

impl PerformanceMonitor {
    /// Create a monitor
    ///
    /// Timers not ended within `timer_ttl` are dropped; at most
    /// `max_active_timers` run at once.
    #[must_use]
    pub fn new(slow_threshold: Duration, timer_ttl: Duration, max_active_timers: u64) -> Self {
        let active = Cache::builder()
            .max_capacity(max_active_timers)
            .time_to_live(timer_ttl)
            .build();
        Self {
            active,
            stats: Mutex::new(BTreeMap::new()),
            probe: MemoryProbe::new(),
            slow_threshold,
        }
    }

    /// Create a monitor from the monitor settings
    #[must_use]
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        Self::new(
            Duration::from_millis(settings.slow_command_threshold_ms),
            Duration::from_secs(settings.active_timer_ttl_secs),
            settings.max_active_timers,
        )
    }

    /// Starts timing `command` for `user_id`
    pub async fn start_timer(&self, command: &str, user_id: i64) -> TimerId {
        let id = Uuid::new_v4();
        let timer = ActiveTimer {
            command: command.to_string(),
            user_id,
            started_at: Instant::now(),
            memory_at_start: self.probe.process_memory(),
        };
        self.active.insert(id, timer).await;
        id
    }

    /// Stops the timer and folds the sample into the command's statistics
    ///
    /// Returns `None` for unknown or expired timer ids.
    pub async fn end_timer(&self, id: TimerId) -> Option<MetricSample> {
        let Some(timer) = self.active.remove(&id).await else {
            debug!(timer_id = %id, "Timer not found or expired");
            return None;
        };
        let elapsed = timer.started_at.elapsed();
        let response_time_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let memory_usage_bytes = self.probe.process_memory();
        let slow = elapsed >= self.slow_threshold;

        if slow {
            warn!(
                command = %timer.command,
                user_id = timer.user_id,
                response_time_ms,
                threshold_ms = self.slow_threshold.as_millis(),
                "Slow command"
            );
        }

        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(timer.command.clone())
            .or_default()
            .record(response_time_ms, memory_usage_bytes, slow);

        let memory_delta_bytes = i64::try_from(memory_usage_bytes)
            .unwrap_or(i64::MAX)
            .saturating_sub(i64::try_from(timer.memory_at_start).unwrap_or(i64::MAX));

        Some(MetricSample {
            command: timer.command,
            user_id: timer.user_id,
            response_time_ms,
            memory_usage_bytes,
            memory_delta_bytes,
        })
    }

    /// Statistics of `command`, `None` before its first finished execution
    #[must_use]
    pub fn get_command_stats(&self, command: &str) -> Option<CommandStats> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(command)
            .cloned()
    }

    /// Statistics of every command, ordered by name
    #[must_use]
    pub fn all_stats(&self) -> BTreeMap<String, CommandStats> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current memory figures and number of running timers
    pub async fn resources(&self) -> ResourceSnapshot {
        self.active.run_pending_tasks().await;
        let (system_used_memory_bytes, system_total_memory_bytes) = self.probe.system_memory();
        ResourceSnapshot {
            process_memory_bytes: self.probe.process_memory(),
            system_used_memory_bytes,
            system_total_memory_bytes,
            active_timers: self.active.entry_count(),
        }
    }
}
