//! # Circuit Breaker Manager
//!
//! Owns the circuit breakers for a set of named components. Each owner
//! (typically an `IntegrationManager`) constructs its own manager; there is no
//! process-wide registry.

use crate::config::CircuitBreakerSettings;
use crate::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitStateTransition, GlobalCircuitBreakerSettings,
    SystemCircuitBreakerMetrics,
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Registry of circuit breakers keyed by component name
#[derive(Debug)]
pub struct CircuitBreakerManager {
    circuit_breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
    component_configs: HashMap<String, CircuitBreakerConfig>,
    settings: GlobalCircuitBreakerSettings,
    transitions: broadcast::Sender<CircuitStateTransition>,
}

impl CircuitBreakerManager {
    pub fn new(default_config: CircuitBreakerConfig, settings: GlobalCircuitBreakerSettings) -> Self {
        let (transitions, _) = broadcast::channel(settings.transition_channel_capacity.max(1));
        Self {
            circuit_breakers: DashMap::new(),
            default_config,
            component_configs: HashMap::new(),
            settings,
            transitions,
        }
    }

    /// Build a manager from the YAML circuit breaker section
    pub fn from_config(config: &CircuitBreakerSettings) -> Self {
        let mut manager = Self::new(
            config.default_config.to_resilience_config(),
            config.global_settings.to_resilience_config(),
        );
        manager.component_configs = config
            .component_configs
            .iter()
            .map(|(name, cfg)| (name.clone(), cfg.to_resilience_config()))
            .collect();

        info!(
            component_configs = manager.component_configs.len(),
            max_circuit_breakers = manager.settings.max_circuit_breakers,
            "🛡️ Circuit breaker manager initialized from configuration"
        );
        manager
    }

    /// Register an explicit configuration for a component.
    ///
    /// Replaces an existing breaker for the component so the new thresholds apply.
    pub fn configure_component(&mut self, component: &str, config: CircuitBreakerConfig) {
        self.component_configs.insert(component.to_string(), config);
        self.circuit_breakers.remove(component);
    }

    /// Get the breaker for a component, creating it on first use
    pub fn get_circuit_breaker(&self, component: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.circuit_breakers.get(component) {
            return existing.clone();
        }

        if self.circuit_breakers.len() >= self.settings.max_circuit_breakers {
            warn!(
                component = %component,
                max_circuit_breakers = self.settings.max_circuit_breakers,
                "Circuit breaker limit reached, creating breaker anyway"
            );
        }

        let config = self.config_for_component(component);
        self.circuit_breakers
            .entry(component.to_string())
            .or_insert_with(|| {
                debug!(component = %component, "Creating circuit breaker");
                Arc::new(CircuitBreaker::with_transition_sender(
                    component.to_string(),
                    config,
                    self.transitions.clone(),
                ))
            })
            .clone()
    }

    /// Create (or replace) the breaker for a component with explicit thresholds
    pub fn register(&self, component: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::with_transition_sender(
            component.to_string(),
            config,
            self.transitions.clone(),
        ));
        self.circuit_breakers
            .insert(component.to_string(), breaker.clone());
        breaker
    }

    pub fn remove(&self, component: &str) -> Option<Arc<CircuitBreaker>> {
        self.circuit_breakers.remove(component).map(|(_, breaker)| breaker)
    }

    /// Look up an existing breaker without creating one
    pub fn circuit_breaker(&self, component: &str) -> Option<Arc<CircuitBreaker>> {
        self.circuit_breakers.get(component).map(|entry| entry.clone())
    }

    pub fn config_for_component(&self, component: &str) -> CircuitBreakerConfig {
        self.component_configs
            .get(component)
            .copied()
            .unwrap_or(self.default_config)
    }

    /// Transitions of every breaker owned by this manager
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<CircuitStateTransition> {
        self.transitions.subscribe()
    }

    pub fn all_metrics(&self) -> SystemCircuitBreakerMetrics {
        let metrics = self
            .circuit_breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().metrics()))
            .collect();
        SystemCircuitBreakerMetrics::from_breakers(metrics)
    }

    /// Open every circuit (emergency stop)
    pub fn force_open_all(&self) {
        warn!(count = self.circuit_breakers.len(), "🚨 Forcing all circuit breakers open");
        for entry in self.circuit_breakers.iter() {
            entry.value().force_open();
        }
    }

    pub fn force_closed_all(&self) {
        warn!(count = self.circuit_breakers.len(), "🚨 Forcing all circuit breakers closed");
        for entry in self.circuit_breakers.iter() {
            entry.value().force_closed();
        }
    }

    pub fn len(&self) -> usize {
        self.circuit_breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuit_breakers.is_empty()
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(
            CircuitBreakerConfig::default(),
            GlobalCircuitBreakerSettings::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerComponentConfig, CircuitBreakerGlobalSettings};
    use crate::resilience::CircuitState;
    use std::time::Duration;

    fn yaml_style_config() -> CircuitBreakerSettings {
        let mut component_configs = HashMap::new();
        component_configs.insert(
            "billing".to_string(),
            CircuitBreakerComponentConfig {
                failure_threshold: 3,
                recovery_timeout_ms: 45_000,
                half_open_success_threshold: 2,
            },
        );
        component_configs.insert(
            "inventory".to_string(),
            CircuitBreakerComponentConfig {
                failure_threshold: 2,
                recovery_timeout_ms: 10_000,
                half_open_success_threshold: 1,
            },
        );

        CircuitBreakerSettings {
            enabled: true,
            global_settings: CircuitBreakerGlobalSettings {
                max_circuit_breakers: 25,
                transition_channel_capacity: 16,
            },
            default_config: CircuitBreakerComponentConfig {
                failure_threshold: 4,
                recovery_timeout_ms: 20_000,
                half_open_success_threshold: 2,
            },
            component_configs,
        }
    }

    #[test]
    fn test_component_configuration_is_applied() {
        let manager = CircuitBreakerManager::from_config(&yaml_style_config());

        let billing = manager.get_circuit_breaker("billing");
        let unknown = manager.get_circuit_breaker("unknown_component");

        assert_eq!(billing.name(), "billing");
        assert_eq!(billing.config().failure_threshold, 3);
        assert_eq!(billing.config().recovery_timeout, Duration::from_secs(45));
        assert_eq!(unknown.config().failure_threshold, 4);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_same_component_returns_same_breaker() {
        let manager = CircuitBreakerManager::default();
        let first = manager.get_circuit_breaker("search");
        let second = manager.get_circuit_breaker("search");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(manager.circuit_breaker("missing").is_none());
    }

    #[test]
    fn test_register_replaces_breaker_with_explicit_config() {
        let manager = CircuitBreakerManager::default();
        let original = manager.get_circuit_breaker("payments");
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
            half_open_success_threshold: 1,
        };

        let registered = manager.register("payments", config);
        assert!(!Arc::ptr_eq(&original, &registered));
        assert_eq!(manager.get_circuit_breaker("payments").config().failure_threshold, 1);

        assert!(manager.remove("payments").is_some());
        assert!(manager.circuit_breaker("payments").is_none());
    }

    #[test]
    fn test_force_open_all_reflected_in_metrics() {
        let manager = CircuitBreakerManager::from_config(&yaml_style_config());
        manager.get_circuit_breaker("billing");
        manager.get_circuit_breaker("inventory");

        manager.force_open_all();
        let metrics = manager.all_metrics();
        assert_eq!(metrics.total_circuit_breakers, 2);
        assert_eq!(metrics.open_circuit_breakers, 2);
        assert!(!metrics.is_healthy());

        manager.force_closed_all();
        assert!(manager.all_metrics().is_healthy());
        assert_eq!(
            manager.get_circuit_breaker("billing").state(),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_shared_transition_channel() {
        let manager = CircuitBreakerManager::default();
        let mut transitions = manager.subscribe_transitions();

        manager.get_circuit_breaker("a").force_open();
        manager.get_circuit_breaker("b").force_open();

        let first = transitions.recv().await.unwrap();
        let second = transitions.recv().await.unwrap();
        assert_eq!(first.component, "a");
        assert_eq!(second.component, "b");
    }
}
