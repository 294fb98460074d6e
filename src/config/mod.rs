//! # Configuration System
//!
//! YAML-based configuration for every resilience and orchestration component.
//!
//! ## Architecture
//!
//! - **Single file**: `tasker-flow.yaml` in the configuration directory
//! - **Environment awareness**: a top-level `development:` / `test:` / `production:`
//!   section is deep-merged over the base values
//! - **Explicit validation**: invalid thresholds are rejected at load time
//! - **Runtime conversion**: each section converts into the type it configures
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tasker_flow::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//!
//! let retry_policy = manager.config().retry.to_retry_policy();
//! let strategy = manager.config().workflow.error_strategy;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::constants::defaults;
use crate::integration::InvocationStrategy;
use crate::orchestration::ErrorStrategy;
use crate::resilience::{CircuitBreakerConfig as ResilienceCircuitBreakerConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring tasker-flow.yaml
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskerFlowConfig {
    /// Default retry policy for integration targets
    pub retry: RetrySettings,

    /// Circuit breaker thresholds
    pub circuit_breakers: CircuitBreakerSettings,

    /// Bulkhead capacities per resource class
    pub resource_pools: ResourcePoolSettings,

    /// Message queue behaviour
    pub queues: QueueSettings,

    /// Event bus behaviour
    pub events: EventBusSettings,

    /// Workflow execution defaults
    pub workflow: WorkflowSettings,

    /// Per-target overrides keyed by target id
    pub targets: HashMap<String, TargetSettings>,

    /// Environment the configuration was loaded for
    pub environment: String,
}

/// Retry and backoff configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_enabled: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_ATTEMPTS,
            base_delay_ms: defaults::BASE_DELAY.as_millis() as u64,
            max_delay_ms: defaults::MAX_DELAY.as_millis() as u64,
            backoff_multiplier: defaults::BACKOFF_MULTIPLIER,
            jitter_enabled: true,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_delays(
                Duration::from_millis(self.base_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            )
            .with_multiplier(self.backoff_multiplier)
            .with_jitter(self.jitter_enabled)
    }
}

/// Circuit breaker configuration integrated with YAML config
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Whether integration calls are guarded by circuit breakers
    pub enabled: bool,

    /// Global circuit breaker settings
    pub global_settings: CircuitBreakerGlobalSettings,

    /// Default configuration for new circuit breakers
    pub default_config: CircuitBreakerComponentConfig,

    /// Specific configurations for named components (integration target ids)
    pub component_configs: HashMap<String, CircuitBreakerComponentConfig>,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            global_settings: CircuitBreakerGlobalSettings::default(),
            default_config: CircuitBreakerComponentConfig::default(),
            component_configs: HashMap::new(),
        }
    }
}

/// Global circuit breaker settings from YAML
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerGlobalSettings {
    /// Maximum number of circuit breakers allowed
    pub max_circuit_breakers: usize,

    /// Buffer size of the state transition notification channel
    pub transition_channel_capacity: usize,
}

impl Default for CircuitBreakerGlobalSettings {
    fn default() -> Self {
        let settings = crate::resilience::GlobalCircuitBreakerSettings::default();
        Self {
            max_circuit_breakers: settings.max_circuit_breakers,
            transition_channel_capacity: settings.transition_channel_capacity,
        }
    }
}

/// Circuit breaker configuration for a specific component from YAML
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerComponentConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: usize,

    /// Time to wait in open state before attempting recovery
    pub recovery_timeout_ms: u64,

    /// Number of successful calls in half-open state to close circuit
    pub half_open_success_threshold: usize,
}

impl Default for CircuitBreakerComponentConfig {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::FAILURE_THRESHOLD,
            recovery_timeout_ms: defaults::RECOVERY_TIMEOUT.as_millis() as u64,
            half_open_success_threshold: defaults::HALF_OPEN_SUCCESS_THRESHOLD,
        }
    }
}

impl CircuitBreakerSettings {
    /// Get configuration for a specific component
    pub fn config_for_component(&self, component_name: &str) -> CircuitBreakerComponentConfig {
        self.component_configs
            .get(component_name)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone())
    }
}

impl CircuitBreakerComponentConfig {
    /// Convert to resilience module's format
    pub fn to_resilience_config(&self) -> ResilienceCircuitBreakerConfig {
        ResilienceCircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            half_open_success_threshold: self.half_open_success_threshold,
        }
    }
}

impl CircuitBreakerGlobalSettings {
    /// Convert to resilience module's format
    pub fn to_resilience_config(&self) -> crate::resilience::GlobalCircuitBreakerSettings {
        crate::resilience::GlobalCircuitBreakerSettings {
            max_circuit_breakers: self.max_circuit_breakers,
            transition_channel_capacity: self.transition_channel_capacity,
        }
    }
}

/// Bulkhead configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResourcePoolSettings {
    /// Capacity for resource classes without an explicit entry
    pub default_capacity: usize,
    pub acquire_timeout_ms: u64,
    /// Capacity per resource class
    pub pools: HashMap<String, usize>,
}

impl Default for ResourcePoolSettings {
    fn default() -> Self {
        Self {
            default_capacity: defaults::POOL_CAPACITY,
            acquire_timeout_ms: defaults::ACQUIRE_TIMEOUT.as_millis() as u64,
            pools: HashMap::new(),
        }
    }
}

impl ResourcePoolSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Message queue configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueSettings {
    pub visibility_timeout_seconds: u64,
    /// Maximum buffered messages per named queue
    pub max_size: usize,
    /// Default `max_retries` stamped on published messages
    pub max_retries: u32,
    /// Idle wait between polls of a queue consumer
    pub poll_interval_ms: u64,
    /// Messages one consumer hands to its handler at the same time
    pub consumer_concurrency: usize,
    /// Backoff applied between redeliveries of a failed message
    pub redelivery: RetrySettings,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout_seconds: defaults::VISIBILITY_TIMEOUT.as_secs(),
            max_size: defaults::QUEUE_MAX_SIZE,
            max_retries: defaults::MESSAGE_MAX_RETRIES,
            poll_interval_ms: defaults::CONSUMER_POLL_INTERVAL.as_millis() as u64,
            consumer_concurrency: defaults::CONSUMER_CONCURRENCY,
            redelivery: RetrySettings::default(),
        }
    }
}

impl QueueSettings {
    /// Get visibility timeout as Duration
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    /// Get poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Event bus configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventBusSettings {
    /// Buffer of the broadcast channel handed to external observers
    pub observer_channel_capacity: usize,
    /// Upper bound on a single subscriber handler invocation
    pub handler_timeout_ms: u64,
}

impl Default for EventBusSettings {
    fn default() -> Self {
        Self {
            observer_channel_capacity: defaults::OBSERVER_CHANNEL_CAPACITY,
            handler_timeout_ms: defaults::HANDLER_TIMEOUT.as_millis() as u64,
        }
    }
}

impl EventBusSettings {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

/// Workflow execution configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkflowSettings {
    /// Strategy for definitions that don't choose one
    pub error_strategy: ErrorStrategy,
    /// Upper bound on steps running at once across all workflows of an orchestrator
    pub max_concurrent_steps: usize,
    pub default_step_timeout_ms: u64,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            error_strategy: ErrorStrategy::Continue,
            max_concurrent_steps: defaults::MAX_CONCURRENT_STEPS,
            default_step_timeout_ms: defaults::STEP_TIMEOUT.as_millis() as u64,
        }
    }
}

impl WorkflowSettings {
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }
}

/// Overrides for a single integration target
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TargetSettings {
    /// Transport used when the caller doesn't pick one
    pub strategy: Option<InvocationStrategy>,
    /// Bulkhead class guarding this target
    pub resource_class: Option<String>,
    /// Retry policy replacing the global default
    pub retry: Option<RetrySettings>,
    /// Breaker thresholds replacing `circuit_breakers.component_configs`
    pub circuit_breaker: Option<CircuitBreakerComponentConfig>,
}

impl TaskerFlowConfig {
    /// Validate configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        Self::validate_retry("retry", &self.retry)?;
        Self::validate_retry("queues.redelivery", &self.queues.redelivery)?;

        Self::validate_breaker(
            "circuit_breakers.default_config",
            &self.circuit_breakers.default_config,
        )?;
        for (name, cfg) in &self.circuit_breakers.component_configs {
            Self::validate_breaker(&format!("circuit_breakers.component_configs.{name}"), cfg)?;
        }

        if self.resource_pools.default_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "resource_pools.default_capacity",
                "0",
                "pool capacity must be greater than 0",
            ));
        }
        if let Some((class, _)) = self.resource_pools.pools.iter().find(|(_, c)| **c == 0) {
            return Err(ConfigurationError::invalid_value(
                format!("resource_pools.pools.{class}"),
                "0",
                "pool capacity must be greater than 0",
            ));
        }

        if self.queues.max_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "queues.max_size",
                "0",
                "queue size must be greater than 0",
            ));
        }
        if self.queues.visibility_timeout_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "queues.visibility_timeout_seconds",
                "0",
                "visibility timeout must be greater than 0",
            ));
        }
        if self.queues.consumer_concurrency == 0 {
            return Err(ConfigurationError::invalid_value(
                "queues.consumer_concurrency",
                "0",
                "at least one message must be handled at a time",
            ));
        }

        if self.workflow.max_concurrent_steps == 0 {
            return Err(ConfigurationError::invalid_value(
                "workflow.max_concurrent_steps",
                "0",
                "at least one step must be allowed to run",
            ));
        }

        for (target, settings) in &self.targets {
            if let Some(retry) = &settings.retry {
                Self::validate_retry(&format!("targets.{target}.retry"), retry)?;
            }
            if let Some(breaker) = &settings.circuit_breaker {
                Self::validate_breaker(&format!("targets.{target}.circuit_breaker"), breaker)?;
            }
            if let Some(class) = &settings.resource_class {
                if class.is_empty() {
                    return Err(ConfigurationError::missing_required_field(
                        format!("targets.{target}.resource_class"),
                        "resource class must not be empty when present",
                    ));
                }
            }
        }

        Ok(())
    }

    fn validate_breaker(
        field: &str,
        cfg: &CircuitBreakerComponentConfig,
    ) -> Result<(), ConfigurationError> {
        if cfg.failure_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                format!("{field}.failure_threshold"),
                "0",
                "failure threshold must be greater than 0",
            ));
        }
        if cfg.half_open_success_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                format!("{field}.half_open_success_threshold"),
                "0",
                "half-open success threshold must be greater than 0",
            ));
        }
        Ok(())
    }

    fn validate_retry(field: &str, retry: &RetrySettings) -> Result<(), ConfigurationError> {
        if retry.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                format!("{field}.max_attempts"),
                "0",
                "at least one attempt is required",
            ));
        }
        if retry.backoff_multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                format!("{field}.backoff_multiplier"),
                retry.backoff_multiplier.to_string(),
                "multiplier must be at least 1.0",
            ));
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(ConfigurationError::invalid_value(
                format!("{field}.base_delay_ms"),
                retry.base_delay_ms.to_string(),
                "base delay must not exceed max delay",
            ));
        }
        Ok(())
    }

    /// Retry policy for a target, falling back to the global default
    pub fn retry_policy_for_target(&self, target_id: &str) -> RetryPolicy {
        self.targets
            .get(target_id)
            .and_then(|t| t.retry.as_ref())
            .unwrap_or(&self.retry)
            .to_retry_policy()
    }

    /// Breaker thresholds for a target: target override, then component config, then default
    pub fn breaker_config_for_target(&self, target_id: &str) -> CircuitBreakerComponentConfig {
        self.targets
            .get(target_id)
            .and_then(|t| t.circuit_breaker.clone())
            .unwrap_or_else(|| self.circuit_breakers.config_for_component(target_id))
    }

    /// Check if running in test environment
    pub fn is_test_environment(&self) -> bool {
        self.environment == "test"
    }

    /// Check if running in production environment
    pub fn is_production_environment(&self) -> bool {
        self.environment == "production"
    }
}
