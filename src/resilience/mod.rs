//! # Resilience Module
//!
//! Fault tolerance primitives shared by every outbound call.
//!
//! ## Architecture
//!
//! - **Circuit Breakers**: Isolate failing dependencies and fail fast while they recover
//! - **Retry Executor**: Bounded retries with exponential backoff and jitter
//! - **Bulkheads**: Bounded permit pools per resource class with FIFO waiters
//! - **Manager**: Per-owner registry of circuit breakers with shared transition notifications
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tasker_flow::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig {
//!     failure_threshold: 5,
//!     recovery_timeout: Duration::from_secs(30),
//!     half_open_success_threshold: 2,
//! };
//!
//! let circuit_breaker = CircuitBreaker::new("inventory_service".to_string(), config);
//!
//! let result = circuit_breaker.call(|| async {
//!     Ok::<&str, std::io::Error>("success")
//! }).await?;
//! # Ok(())
//! # }
//! ```

pub mod bulkhead;
pub mod circuit_breaker;
pub mod config;
pub mod manager;
pub mod metrics;
pub mod retry;

pub use bulkhead::{BulkheadError, BulkheadRegistry, PoolStats, ResourcePermit, ResourcePool};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerError, CircuitPermit, CircuitState, CircuitStateTransition,
};
pub use config::{CircuitBreakerConfig, GlobalCircuitBreakerSettings};
pub use manager::CircuitBreakerManager;
pub use metrics::{CircuitBreakerMetrics, SystemCircuitBreakerMetrics};
pub use retry::{Classify, RetryError, RetryExecutor, RetryPolicy, RetryPredicate};
