//! Process-wide set of circuit breakers
//!
//! One registry is created at startup and injected wherever breakers are
//! needed. Breaker state is process-local: with several gateway instances
//! each one trips its own circuits.

use super::circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Registry of breakers keyed by dependency name
#[derive(Debug, Default)]
pub struct CircuitRegistry {
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an explicitly configured breaker, replacing any previous one
    pub fn register(&self, breaker: CircuitBreaker) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(breaker);
        self.breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(breaker.name().to_string(), breaker.clone());
        breaker
    }

    /// Returns the breaker for `name` if one exists
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Current state of every breaker, ordered by name
    #[must_use]
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        self.all()
            .iter()
            .map(|b| (b.name().to_string(), b.state()))
            .collect()
    }

    /// Snapshots of every breaker, ordered by name
    #[must_use]
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        self.all().iter().map(|b| b.snapshot()).collect()
    }

    fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_register_replaces_and_get_finds() {
        let registry = CircuitRegistry::new();
        let first = registry.register(CircuitBreaker::for_dependency(
            "deepseek",
            5,
            Duration::from_secs(60),
        ));
        let second = registry.register(CircuitBreaker::for_dependency(
            "deepseek",
            2,
            Duration::from_secs(60),
        ));
        assert!(!Arc::ptr_eq(&first, &second));
        let found = registry.get("deepseek").expect("registered");
        assert!(Arc::ptr_eq(&found, &second));
        assert!(registry.get("geocoding").is_none());
        assert_eq!(registry.states().len(), 1);
    }

    #[test]
    fn test_registered_breakers_keep_their_thresholds() {
        let registry = CircuitRegistry::default();
        registry.register(CircuitBreaker::for_dependency(
            "deepseek",
            5,
            Duration::from_secs(60),
        ));
        registry.register(CircuitBreaker::for_dependency(
            "laravel_api",
            3,
            Duration::from_secs(30),
        ));

        let snapshots = registry.snapshots();
        let names: Vec<_> = snapshots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["deepseek", "laravel_api"]);
        assert_eq!(snapshots[0].failure_threshold, 5);
        assert_eq!(snapshots[1].failure_threshold, 3);
    }
}
