//! Global service level and feature gating
//!
//! The current level is stored in a single atomic; each level maps to a
//! static [`FeatureFlags`] set, so readers always observe one complete set.
//!
//! Automatic evaluation worsens the level immediately and recovers one step
//! at a time once the better target has held for `recovery_hold`.

use super::circuit_breaker::CircuitState;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Service level of the whole gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationLevel {
    /// Everything enabled
    Healthy,
    /// Optional features off, slow mode on
    Degraded,
    /// Read-only, all optional features off
    Unhealthy,
}

impl DegradationLevel {
    /// Lower-case name used in logs and endpoints
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    /// Feature set of this level
    #[must_use]
    pub const fn flags(self) -> FeatureFlags {
        match self {
            Self::Healthy => FeatureFlags {
                nlp: true,
                analytics: true,
                slow_mode: false,
                read_only: false,
            },
            Self::Degraded => FeatureFlags {
                nlp: false,
                analytics: false,
                slow_mode: true,
                read_only: false,
            },
            Self::Unhealthy => FeatureFlags {
                nlp: false,
                analytics: false,
                slow_mode: true,
                read_only: true,
            },
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Unhealthy => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Healthy,
            1 => Self::Degraded,
            _ => Self::Unhealthy,
        }
    }

    const fn improved(self) -> Self {
        match self {
            Self::Unhealthy => Self::Degraded,
            Self::Degraded | Self::Healthy => Self::Healthy,
        }
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DegradationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "healthy" => Ok(Self::Healthy),
            "degraded" => Ok(Self::Degraded),
            "unhealthy" => Ok(Self::Unhealthy),
            other => Err(format!("unknown degradation level: {other}")),
        }
    }
}

/// Feature gated by the degradation level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// Natural-language processing through the inference API
    Nlp,
    /// Usage analytics and statistics
    Analytics,
    /// Per-user message throttling
    SlowMode,
    /// Writes are refused
    ReadOnly,
}

impl FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nlp" => Ok(Self::Nlp),
            "analytics" => Ok(Self::Analytics),
            "slow_mode" => Ok(Self::SlowMode),
            "read_only" => Ok(Self::ReadOnly),
            other => Err(format!("unknown feature: {other}")),
        }
    }
}

/// Complete flag set of one level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeatureFlags {
    /// Inference-backed replies
    pub nlp: bool,
    /// Analytics collection
    pub analytics: bool,
    /// Throttled processing
    pub slow_mode: bool,
    /// Writes refused
    pub read_only: bool,
}

impl FeatureFlags {
    /// Whether `feature` is on in this set
    #[must_use]
    pub const fn is_enabled(self, feature: Feature) -> bool {
        match feature {
            Feature::Nlp => self.nlp,
            Feature::Analytics => self.analytics,
            Feature::SlowMode => self.slow_mode,
            Feature::ReadOnly => self.read_only,
        }
    }
}

/// Inputs of the automatic evaluation
#[derive(Debug, Clone, Default)]
pub struct HealthSnapshot {
    /// State of every registered circuit
    pub circuits: Vec<(String, CircuitState)>,
    /// Whether the session store answered its last ping
    pub store_available: bool,
    /// Whether admission control is rejecting conversations
    pub under_backpressure: bool,
}

/// Circuit names the automatic policy treats specially
#[derive(Debug, Clone)]
pub struct DegradationPolicy {
    /// Inference dependency
    pub primary: String,
    /// Pricing/alerts dependency
    pub secondary: String,
    /// How long a better target must hold before recovering a step
    pub recovery_hold: Duration,
}

impl Default for DegradationPolicy {
    fn default() -> Self {
        Self {
            primary: crate::config::DEEPSEEK.to_string(),
            secondary: crate::config::LARAVEL_API.to_string(),
            recovery_hold: Duration::from_secs(30),
        }
    }
}

impl DegradationPolicy {
    /// Level the snapshot calls for, before hysteresis
    #[must_use]
    pub fn target(&self, health: &HealthSnapshot) -> DegradationLevel {
        let state_of = |name: &str| {
            health
                .circuits
                .iter()
                .find(|(n, _)| n == name)
                .map_or(CircuitState::Closed, |(_, s)| *s)
        };
        let open = health
            .circuits
            .iter()
            .filter(|(_, s)| *s == CircuitState::Open)
            .count();
        let troubled = health
            .circuits
            .iter()
            .any(|(_, s)| *s != CircuitState::Closed);

        let both_core_down = state_of(&self.primary) != CircuitState::Closed
            && state_of(&self.secondary) != CircuitState::Closed;
        // A majority only means something once there are more circuits than the core pair
        let majority_open = health.circuits.len() >= 3 && open * 2 > health.circuits.len();

        if both_core_down || majority_open || (!health.store_available && open > 0) {
            DegradationLevel::Unhealthy
        } else if troubled || !health.store_available || health.under_backpressure {
            DegradationLevel::Degraded
        } else {
            DegradationLevel::Healthy
        }
    }
}

#[derive(Debug)]
struct Transition {
    forced: Option<DegradationLevel>,
    recovering_since: Option<Instant>,
}

/// Owner of the process-wide degradation level
#[derive(Debug)]
pub struct DegradationManager {
    level: AtomicU8,
    policy: DegradationPolicy,
    transition: Mutex<Transition>,
}

impl Default for DegradationManager {
    fn default() -> Self {
        Self::new(DegradationPolicy::default())
    }
}

impl DegradationManager {
    /// Create a manager starting at `healthy`
    #[must_use]
    pub const fn new(policy: DegradationPolicy) -> Self {
        Self {
            level: AtomicU8::new(0),
            policy,
            transition: Mutex::new(Transition {
                forced: None,
                recovering_since: None,
            }),
        }
    }

    /// Create a manager with the configured recovery hold
    #[must_use]
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        Self::new(DegradationPolicy {
            recovery_hold: Duration::from_secs(settings.degradation_recovery_hold_secs),
            ..DegradationPolicy::default()
        })
    }

    /// Current level
    #[must_use]
    pub fn current_level(&self) -> DegradationLevel {
        DegradationLevel::from_u8(self.level.load(Ordering::Acquire))
    }

    /// Flags of the current level
    #[must_use]
    pub fn flags(&self) -> FeatureFlags {
        self.current_level().flags()
    }

    /// Whether `feature` is currently on
    #[must_use]
    pub fn is_feature_enabled(&self, feature: Feature) -> bool {
        self.flags().is_enabled(feature)
    }

    /// Whether slow mode is on
    #[must_use]
    pub fn is_slow_mode_enabled(&self) -> bool {
        self.flags().slow_mode
    }

    /// Whether writes are refused
    #[must_use]
    pub fn is_read_only_mode(&self) -> bool {
        self.flags().read_only
    }

    /// Whether an operator override is active
    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.lock().forced.is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Transition> {
        self.transition.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self, next: DegradationLevel, reason: &str) {
        let previous = DegradationLevel::from_u8(self.level.swap(next.to_u8(), Ordering::AcqRel));
        if previous == next {
            return;
        }
        if next > previous {
            warn!(from = %previous, to = %next, reason, "Degradation level worsened");
        } else {
            info!(from = %previous, to = %next, reason, "Degradation level improved");
        }
    }

    /// Pins the level until [`Self::clear_override`] is called
    pub fn force_degradation_level(&self, level: DegradationLevel) {
        let mut transition = self.lock();
        transition.forced = Some(level);
        transition.recovering_since = None;
        self.store(level, "forced");
    }

    /// Returns control to automatic evaluation
    pub fn clear_override(&self) {
        let mut transition = self.lock();
        if transition.forced.take().is_some() {
            info!("Degradation override cleared");
        }
    }

    /// Applies the automatic policy to `health` and returns the new level
    pub fn evaluate(&self, health: &HealthSnapshot) -> DegradationLevel {
        let mut transition = self.lock();
        if let Some(forced) = transition.forced {
            return forced;
        }

        let current = self.current_level();
        let target = self.policy.target(health);
        let now = Instant::now();

        if target >= current {
            transition.recovering_since = None;
            if target > current {
                self.store(target, "circuit health");
            }
            return target;
        }

        match transition.recovering_since {
            None => {
                transition.recovering_since = Some(now);
                current
            }
            Some(since) if now.saturating_duration_since(since) >= self.policy.recovery_hold => {
                let next = current.improved();
                self.store(next, "recovery hold elapsed");
                transition.recovering_since = (next > target).then_some(now);
                next
            }
            Some(_) => current,
        }
    }

    /// Apology shown instead of a reply that needs a disabled feature
    ///
    /// Returns `None` when `service` is fully available at the current level.
    #[must_use]
    pub fn get_fallback_response(&self, service: &str, query: &str) -> Option<String> {
        let flags = self.flags();
        let service = service.trim().to_ascii_lowercase();
        let topic = if query.trim().is_empty() {
            String::new()
        } else {
            format!(" sobre \"{}\"", query.trim())
        };

        match service.as_str() {
            "deepseek" | "nlp" | "ai" if !flags.nlp => Some(format!(
                "Lo sentimos, el asistente inteligente (deepseek) no está disponible en este momento y no podemos responder tu consulta{topic}. Usa /precio <combustible> para ver los precios actuales."
            )),
            "analytics" | "stats" if !flags.analytics => Some(format!(
                "Lo sentimos, las estadísticas (analytics) están desactivadas temporalmente. Tu consulta{topic} no se ha podido procesar."
            )),
            "laravel_api" | "internal_api" | "alerts" if flags.read_only => Some(format!(
                "Lo sentimos, el servicio de precios y alertas (laravel_api) está en modo solo lectura. No podemos guardar cambios{topic} ahora mismo; inténtalo más tarde."
            )),
            _ if self.current_level() == DegradationLevel::Unhealthy => Some(format!(
                "Lo sentimos, el servicio {service} está experimentando problemas. Inténtalo de nuevo en unos minutos."
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(deepseek: CircuitState, laravel: CircuitState) -> HealthSnapshot {
        HealthSnapshot {
            circuits: vec![
                ("deepseek".to_string(), deepseek),
                ("laravel_api".to_string(), laravel),
            ],
            store_available: true,
            under_backpressure: false,
        }
    }

    #[test]
    fn test_forced_unhealthy_is_read_only() {
        let manager = DegradationManager::default();
        manager.force_degradation_level(DegradationLevel::Unhealthy);
        assert!(manager.is_read_only_mode());
        assert!(!manager.is_feature_enabled(Feature::Nlp));
        assert!(!manager.is_feature_enabled(Feature::Analytics));
    }

    #[test]
    fn test_forced_degraded_enables_slow_mode_and_fallback() {
        let manager = DegradationManager::default();
        manager.force_degradation_level(DegradationLevel::Degraded);
        assert!(manager.is_slow_mode_enabled());
        assert!(!manager.is_read_only_mode());
        let fallback = manager.get_fallback_response("deepseek", "precio gasolina");
        assert!(fallback.is_some_and(|text| text.contains("deepseek")));
    }

    #[test]
    fn test_healthy_has_no_fallback() {
        let manager = DegradationManager::default();
        assert_eq!(manager.current_level(), DegradationLevel::Healthy);
        assert!(manager.get_fallback_response("deepseek", "hola").is_none());
        assert!(manager.get_fallback_response("laravel_api", "alerta").is_none());
    }

    #[test]
    fn test_fallback_is_deterministic() {
        let manager = DegradationManager::default();
        manager.force_degradation_level(DegradationLevel::Unhealthy);
        assert_eq!(
            manager.get_fallback_response("laravel_api", "alerta diésel"),
            manager.get_fallback_response("laravel_api", "alerta diésel")
        );
    }

    #[test]
    fn test_forced_level_ignores_health() {
        let manager = DegradationManager::default();
        manager.force_degradation_level(DegradationLevel::Degraded);
        let level = manager.evaluate(&snapshot(CircuitState::Closed, CircuitState::Closed));
        assert_eq!(level, DegradationLevel::Degraded);
        manager.clear_override();
        assert!(!manager.is_forced());
    }

    #[test]
    fn test_policy_targets() {
        let policy = DegradationPolicy::default();
        assert_eq!(
            policy.target(&snapshot(CircuitState::Closed, CircuitState::Closed)),
            DegradationLevel::Healthy
        );
        assert_eq!(
            policy.target(&HealthSnapshot {
                circuits: vec![
                    ("deepseek".to_string(), CircuitState::HalfOpen),
                    ("laravel_api".to_string(), CircuitState::Closed),
                    ("geo".to_string(), CircuitState::Closed),
                ],
                store_available: true,
                under_backpressure: false,
            }),
            DegradationLevel::Degraded
        );
        assert_eq!(
            policy.target(&snapshot(CircuitState::Open, CircuitState::Open)),
            DegradationLevel::Unhealthy
        );
        let mut busy = snapshot(CircuitState::Closed, CircuitState::Closed);
        busy.under_backpressure = true;
        assert_eq!(policy.target(&busy), DegradationLevel::Degraded);
    }

    #[test]
    fn test_open_inference_circuit_alone_is_degraded() {
        let policy = DegradationPolicy::default();
        let manager = DegradationManager::default();
        let deepseek_down = snapshot(CircuitState::Open, CircuitState::Closed);
        assert_eq!(policy.target(&deepseek_down), DegradationLevel::Degraded);
        assert_eq!(manager.evaluate(&deepseek_down), DegradationLevel::Degraded);
        assert!(!manager.is_read_only_mode());
        assert!(!manager.is_feature_enabled(Feature::Nlp));

        let laravel_down = snapshot(CircuitState::Closed, CircuitState::Open);
        assert_eq!(policy.target(&laravel_down), DegradationLevel::Degraded);
    }

    #[test]
    fn test_majority_of_many_circuits_open_is_unhealthy() {
        let policy = DegradationPolicy::default();
        let mut health = snapshot(CircuitState::Open, CircuitState::Closed);
        health
            .circuits
            .push(("geocoding".to_string(), CircuitState::Closed));
        assert_eq!(policy.target(&health), DegradationLevel::Degraded);

        health.circuits[2].1 = CircuitState::Open;
        assert_eq!(policy.target(&health), DegradationLevel::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worsens_immediately_recovers_after_hold() {
        let manager = DegradationManager::new(DegradationPolicy {
            recovery_hold: Duration::from_secs(30),
            ..DegradationPolicy::default()
        });
        let down = snapshot(CircuitState::Open, CircuitState::Open);
        let up = snapshot(CircuitState::Closed, CircuitState::Closed);

        assert_eq!(manager.evaluate(&down), DegradationLevel::Unhealthy);

        assert_eq!(manager.evaluate(&up), DegradationLevel::Unhealthy);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(manager.evaluate(&up), DegradationLevel::Degraded);
        assert_eq!(manager.evaluate(&up), DegradationLevel::Degraded);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(manager.evaluate(&up), DegradationLevel::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relapse_resets_recovery_clock() {
        let manager = DegradationManager::default();
        let degraded = snapshot(CircuitState::Open, CircuitState::Closed);
        let up = snapshot(CircuitState::Closed, CircuitState::Closed);

        assert_eq!(manager.evaluate(&degraded), DegradationLevel::Degraded);
        manager.evaluate(&up);
        tokio::time::advance(Duration::from_secs(20)).await;
        manager.evaluate(&degraded);
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(manager.evaluate(&up), DegradationLevel::Degraded);
    }
}
