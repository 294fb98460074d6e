//! Runtime configuration for circuit breakers.

use crate::constants::defaults;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Thresholds governing a single circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in CLOSED state before the circuit opens
    pub failure_threshold: usize,

    /// Time the circuit stays OPEN before a half-open trial is allowed
    pub recovery_timeout: Duration,

    /// Consecutive half-open successes required to close the circuit
    pub half_open_success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::FAILURE_THRESHOLD,
            recovery_timeout: defaults::RECOVERY_TIMEOUT,
            half_open_success_threshold: defaults::HALF_OPEN_SUCCESS_THRESHOLD,
        }
    }
}

/// Settings that apply to every breaker owned by a manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalCircuitBreakerSettings {
    /// Maximum number of circuit breakers a manager will create
    pub max_circuit_breakers: usize,

    /// Capacity of the state-transition notification channel
    pub transition_channel_capacity: usize,
}

impl Default for GlobalCircuitBreakerSettings {
    fn default() -> Self {
        Self {
            max_circuit_breakers: 256,
            transition_channel_capacity: 128,
        }
    }
}
