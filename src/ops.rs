//! Read-only operational endpoints
//!
//! `/health`, `/status`, `/circuits` and `/metrics`. Health and status
//! requests also run the automatic degradation evaluation.

use crate::clients::PricingApi;
use crate::concurrency::{ConcurrencyManager, ConcurrencyStats};
use crate::gateway::{Dispatcher, DispatcherStats};
use crate::monitor::{CommandStats, PerformanceMonitor, ResourceSnapshot};
use crate::resilience::timeout::DependencyCallStats;
use crate::resilience::{
    CircuitRegistry, CircuitSnapshot, CircuitState, DegradationLevel, DegradationManager,
    FeatureFlags, HealthSnapshot, TimeoutManager,
};
use crate::session::{SessionManager, SessionMetrics};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shared state of the ops API
#[derive(Clone)]
pub struct OpsState {
    /// All circuit breakers
    pub registry: Arc<CircuitRegistry>,
    /// Global service level
    pub degradation: Arc<DegradationManager>,
    /// Admission control
    pub concurrency: Arc<ConcurrencyManager>,
    /// Session persistence
    pub sessions: SessionManager,
    /// Command timings
    pub monitor: Arc<PerformanceMonitor>,
    /// Dependency call counters
    pub timeouts: Arc<TimeoutManager>,
    /// Worker pool, when running
    pub dispatcher: Option<Dispatcher>,
    /// Pricing API checked as the `database` health entry
    pub pricing: Option<Arc<dyn PricingApi>>,
    /// Deadline of the pricing API ping
    pub pricing_timeout: Duration,
    /// Process start
    pub started_at: Instant,
}

/// Result of one health evaluation
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Inputs used
    pub snapshot: HealthSnapshot,
    /// Level after evaluation
    pub level: DegradationLevel,
    /// Whether the pricing API answered, `None` when not configured
    pub database: Option<bool>,
}

impl OpsState {
    /// Gathers health inputs and lets the degradation manager evaluate them
    pub async fn evaluate_health(&self) -> HealthReport {
        let store_available = self.sessions.is_store_available().await;
        let database = match &self.pricing {
            Some(api) => Some(matches!(
                tokio::time::timeout(self.pricing_timeout, api.ping()).await,
                Ok(Ok(()))
            )),
            None => None,
        };
        let snapshot = HealthSnapshot {
            circuits: self.registry.states(),
            store_available,
            under_backpressure: self.concurrency.stats().under_backpressure,
        };
        let level = self.degradation.evaluate(&snapshot);
        HealthReport {
            snapshot,
            level,
            database,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthChecks {
    redis: &'static str,
    database: &'static str,
    circuit_breakers: &'static str,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: DegradationLevel,
    checks: HealthChecks,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    level: DegradationLevel,
    forced: bool,
    features: FeatureFlags,
    concurrency: ConcurrencyStats,
}

#[derive(Debug, Serialize)]
struct CircuitsResponse {
    circuits: BTreeMap<String, CircuitSnapshot>,
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    uptime_secs: u64,
    commands: BTreeMap<String, CommandStats>,
    dependencies: BTreeMap<String, DependencyCallStats>,
    sessions: SessionMetrics,
    resources: ResourceSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    dispatcher: Option<DispatcherStats>,
}

/// Build the axum router for the ops API.
pub fn router(state: OpsState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/circuits", get(circuits))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serves the ops API on `addr` until `shutdown` fires.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn serve(state: OpsState, addr: SocketAddr, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Ops API listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health(State(state): State<OpsState>) -> (StatusCode, Json<HealthResponse>) {
    let report = state.evaluate_health().await;
    let circuits = &report.snapshot.circuits;
    let circuit_breakers = if circuits.iter().all(|(_, s)| *s == CircuitState::Closed) {
        "ok"
    } else if circuits.iter().any(|(_, s)| *s == CircuitState::Open) {
        "open"
    } else {
        "recovering"
    };
    let checks = HealthChecks {
        redis: if report.snapshot.store_available { "ok" } else { "error" },
        database: match report.database {
            Some(true) => "ok",
            Some(false) => "error",
            None => "not_configured",
        },
        circuit_breakers,
    };
    let code = if report.level == DegradationLevel::Unhealthy {
        warn!(?checks, "Health check reports unhealthy");
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        code,
        Json(HealthResponse {
            status: report.level,
            checks,
            timestamp: Utc::now(),
        }),
    )
}

async fn status(State(state): State<OpsState>) -> Json<StatusResponse> {
    let report = state.evaluate_health().await;
    Json(StatusResponse {
        level: report.level,
        forced: state.degradation.is_forced(),
        features: report.level.flags(),
        concurrency: state.concurrency.stats(),
    })
}

async fn circuits(State(state): State<OpsState>) -> Json<CircuitsResponse> {
    let circuits = state
        .registry
        .snapshots()
        .into_iter()
        .map(|s| (s.name.clone(), s))
        .collect();
    Json(CircuitsResponse { circuits })
}

async fn metrics(State(state): State<OpsState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        uptime_secs: state.started_at.elapsed().as_secs(),
        commands: state.monitor.all_stats(),
        dependencies: state.timeouts.stats(),
        sessions: state.sessions.get_session_metrics().await,
        resources: state.monitor.resources().await,
        dispatcher: state.dispatcher.as_ref().map(Dispatcher::stats),
    })
}
