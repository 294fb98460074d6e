//! Call metrics collected by circuit breakers.

use crate::resilience::CircuitState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Per-breaker counters plus derived rates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Calls refused without invoking the operation
    pub rejected_count: u64,
    pub consecutive_failures: u64,
    pub consecutive_successes: u64,
    pub total_duration: Duration,
    pub last_failure_at: Option<DateTime<Utc>>,

    // Derived fields, populated on snapshot
    pub current_state: CircuitState,
    pub failure_rate: f64,
    pub success_rate: f64,
    pub average_duration: Duration,
}

impl CircuitBreakerMetrics {
    pub fn new() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            rejected_count: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_duration: Duration::ZERO,
            last_failure_at: None,
            current_state: CircuitState::Closed,
            failure_rate: 0.0,
            success_rate: 0.0,
            average_duration: Duration::ZERO,
        }
    }

    /// Fill in the derived fields from the raw counters
    pub(crate) fn finalize(mut self, state: CircuitState) -> Self {
        self.current_state = state;
        if self.total_calls > 0 {
            self.failure_rate = self.failure_count as f64 / self.total_calls as f64;
            self.success_rate = self.success_count as f64 / self.total_calls as f64;
            self.average_duration = self.total_duration / self.total_calls as u32;
        }
        self
    }
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate view over every breaker owned by a manager
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemCircuitBreakerMetrics {
    pub circuit_breakers: HashMap<String, CircuitBreakerMetrics>,
    pub total_circuit_breakers: usize,
    pub open_circuit_breakers: usize,
    pub half_open_circuit_breakers: usize,
}

impl SystemCircuitBreakerMetrics {
    pub fn from_breakers(circuit_breakers: HashMap<String, CircuitBreakerMetrics>) -> Self {
        let open_circuit_breakers = circuit_breakers
            .values()
            .filter(|m| m.current_state == CircuitState::Open)
            .count();
        let half_open_circuit_breakers = circuit_breakers
            .values()
            .filter(|m| m.current_state == CircuitState::HalfOpen)
            .count();

        Self {
            total_circuit_breakers: circuit_breakers.len(),
            open_circuit_breakers,
            half_open_circuit_breakers,
            circuit_breakers,
        }
    }

    /// True when no breaker is open
    pub fn is_healthy(&self) -> bool {
        self.open_circuit_breakers == 0
    }
}
