//! # Circuit Breaker Implementation
//!
//! Provides fault isolation to prevent cascade failures when a dependency is unhealthy.
//! The breaker follows the classic three-state pattern: Closed (normal operation),
//! Open (failing fast) and Half-Open (probing recovery with one trial call at a time).
//!
//! All counters and the state itself are mutated inside a single critical section,
//! so concurrent callers never lose a failure increment or observe a torn transition.
//! The state is mirrored in an atomic for lock-free reads.

use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed = 0,
    /// Failure mode - all calls fail fast without executing
    Open = 1,
    /// Testing recovery - one trial call at a time
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open, // Default to safest state
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Notification emitted on every state change, usable for alerting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitStateTransition {
    pub component: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, rejecting all calls
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Operation failed and was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

#[derive(Debug)]
struct BreakerInner {
    metrics: CircuitBreakerMetrics,
    /// Set when the circuit opens; recovery is measured from here
    last_failure_time: Option<Instant>,
    /// A half-open trial call is currently outstanding
    trial_in_flight: bool,
}

/// Core circuit breaker implementation
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Component name for logging and metrics
    name: String,

    /// Mirror of the current state for lock-free reads
    state: AtomicU8,

    /// Configuration parameters
    config: CircuitBreakerConfig,

    /// Counters and timing, always mutated together with `state`
    inner: Mutex<BreakerInner>,

    /// State transition notifications
    transitions: broadcast::Sender<CircuitStateTransition>,
}

/// Admission ticket for a single call through the breaker.
///
/// Report the outcome with [`CircuitPermit::record_success`] or
/// [`CircuitPermit::record_failure`]. Dropping an unreported permit (for example
/// when the caller is cancelled) releases a half-open trial slot without
/// counting an outcome.
#[derive(Debug)]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    started_at: Instant,
    trial: bool,
    reported: bool,
}

impl CircuitPermit<'_> {
    /// Whether this call is a half-open recovery trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.reported = true;
        self.breaker.on_success(self.started_at.elapsed());
    }

    pub fn record_failure(mut self) {
        self.reported = true;
        self.breaker.on_failure(self.started_at.elapsed());
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.reported && self.trial {
            self.breaker.inner.lock().trial_in_flight = false;
            debug!(component = %self.breaker.name, "Half-open trial abandoned without outcome");
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with its own transition channel
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self::with_transition_sender(name, config, transitions)
    }

    /// Create a circuit breaker that reports transitions on a shared channel
    pub fn with_transition_sender(
        name: String,
        config: CircuitBreakerConfig,
        transitions: broadcast::Sender<CircuitStateTransition>,
    ) -> Self {
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
            half_open_success_threshold = config.half_open_success_threshold,
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            config,
            inner: Mutex::new(BreakerInner {
                metrics: CircuitBreakerMetrics::new(),
                last_failure_time: None,
                trial_in_flight: false,
            }),
            transitions,
        }
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Get component name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Subscribe to state transition notifications
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<CircuitStateTransition> {
        self.transitions.subscribe()
    }

    /// Execute an operation with circuit breaker protection
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().ok_or_else(|| CircuitBreakerError::CircuitOpen {
            component: self.name.clone(),
        })?;

        match operation().await {
            Ok(value) => {
                permit.record_success();
                Ok(value)
            }
            Err(err) => {
                permit.record_failure();
                Err(CircuitBreakerError::OperationFailed(err))
            }
        }
    }

    /// Ask for admission of one call.
    ///
    /// Returns `None` when the call must be rejected: the circuit is open and the
    /// recovery timeout has not elapsed, or a half-open trial is already running.
    pub fn try_acquire(&self) -> Option<CircuitPermit<'_>> {
        let mut inner = self.inner.lock();

        let trial = match self.state() {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let recovered = inner
                    .last_failure_time
                    .map(|opened| opened.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if !recovered {
                    inner.metrics.rejected_count += 1;
                    return None;
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.metrics.rejected_count += 1;
                    return None;
                }
                inner.trial_in_flight = true;
                true
            }
        };

        Some(CircuitPermit {
            breaker: self,
            started_at: Instant::now(),
            trial,
            reported: false,
        })
    }

    fn on_success(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.success_count += 1;
        inner.metrics.total_duration += duration;

        debug!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            "🟢 Operation succeeded"
        );

        match self.state() {
            CircuitState::Closed => {
                inner.metrics.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.metrics.consecutive_successes += 1;
                if inner.metrics.consecutive_successes
                    >= self.config.half_open_success_threshold as u64
                {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                // A call admitted before another caller tripped the circuit
                warn!(component = %self.name, "Success recorded while circuit is open");
            }
        }
    }

    fn on_failure(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.failure_count += 1;
        inner.metrics.total_duration += duration;
        inner.metrics.last_failure_at = Some(Utc::now());

        warn!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            "🔴 Operation failed"
        );

        match self.state() {
            CircuitState::Closed => {
                inner.metrics.consecutive_failures += 1;
                if inner.metrics.consecutive_failures >= self.config.failure_threshold as u64 {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // Any failure while half-open immediately reopens the circuit
                inner.trial_in_flight = false;
                inner.metrics.consecutive_failures += 1;
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {
                inner.metrics.consecutive_failures += 1;
            }
        }
    }

    /// Apply a transition while holding the state lock
    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = self.state();
        if from == to {
            return;
        }
        self.state.store(to as u8, Ordering::Release);

        match to {
            CircuitState::Open => {
                inner.last_failure_time = Some(Instant::now());
                inner.metrics.consecutive_successes = 0;
                inner.trial_in_flight = false;
                error!(
                    component = %self.name,
                    consecutive_failures = inner.metrics.consecutive_failures,
                    failure_threshold = self.config.failure_threshold,
                    recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
                    "🔴 Circuit breaker opened (failing fast)"
                );
            }
            CircuitState::HalfOpen => {
                inner.metrics.consecutive_successes = 0;
                info!(
                    component = %self.name,
                    half_open_success_threshold = self.config.half_open_success_threshold,
                    "🟡 Circuit breaker half-open (testing recovery)"
                );
            }
            CircuitState::Closed => {
                inner.metrics.consecutive_failures = 0;
                inner.metrics.consecutive_successes = 0;
                inner.last_failure_time = None;
                inner.trial_in_flight = false;
                info!(
                    component = %self.name,
                    total_calls = inner.metrics.total_calls,
                    "🟢 Circuit breaker closed (recovered)"
                );
            }
        }

        // No receivers is fine, nobody is alerting on this breaker
        let _ = self.transitions.send(CircuitStateTransition {
            component: self.name.clone(),
            from,
            to,
            at: Utc::now(),
        });
    }

    /// Force circuit to open state (for emergency situations)
    pub fn force_open(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced open");
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Open);
    }

    /// Force circuit to closed state (for emergency recovery)
    pub fn force_closed(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced closed");
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        inner.metrics.clone().finalize(self.state())
    }

    /// Check if circuit is healthy (closed state with low failure rate)
    pub fn is_healthy(&self) -> bool {
        if self.state() != CircuitState::Closed {
            return false;
        }

        let metrics = self.metrics();
        if metrics.total_calls < 10 {
            // Too few calls to determine health
            return true;
        }

        metrics.failure_rate < 0.1
    }
}
