//! Integration error types.
//!
//! [`InvocationFailure`] is what a single attempt fails with; the retry
//! executor classifies it. [`IntegrationError`] is the terminal error handed to
//! callers, annotated with the target and the number of attempts made.

use super::strategy::InvocationStrategy;
use super::worker::WorkerError;
use crate::error::ErrorKind;
use crate::events::EventBusError;
use crate::messaging::MessagingError;
use crate::resilience::{BulkheadError, Classify};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvocationFailure {
    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("target is not registered")]
    TargetNotFound,

    #[error("target is already registered")]
    TargetAlreadyRegistered,

    #[error("invocation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("worker produced no reply")]
    NoReply,

    #[error("{strategy} strategy unavailable: {reason}")]
    StrategyUnavailable {
        strategy: InvocationStrategy,
        reason: String,
    },

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    ResourceExhausted(#[from] BulkheadError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    EventBus(#[from] EventBusError),
}

impl Classify for InvocationFailure {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen | Self::ResourceExhausted(_) => ErrorKind::System,
            Self::Timeout { .. } | Self::NoReply => ErrorKind::Transient,
            Self::TargetNotFound
            | Self::TargetAlreadyRegistered
            | Self::StrategyUnavailable { .. } => ErrorKind::Permanent,
            Self::Worker(e) => e.kind(),
            Self::Messaging(e) => e.kind(),
            Self::EventBus(e) => e.kind(),
        }
    }
}

/// Terminal failure of an invocation
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Integration with {target_id} failed after {attempts} attempt(s): {cause}")]
pub struct IntegrationError {
    pub target_id: String,
    /// Attempts actually made; zero when the call never reached the worker
    pub attempts: u32,
    #[source]
    pub cause: InvocationFailure,
}

impl IntegrationError {
    pub fn new(target_id: impl Into<String>, attempts: u32, cause: InvocationFailure) -> Self {
        Self {
            target_id: target_id.into(),
            attempts,
            cause,
        }
    }

    pub fn target_not_found(target_id: impl Into<String>) -> Self {
        Self::new(target_id, 0, InvocationFailure::TargetNotFound)
    }

    pub fn circuit_open(target_id: impl Into<String>) -> Self {
        Self::new(target_id, 0, InvocationFailure::CircuitOpen)
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self.cause, InvocationFailure::CircuitOpen)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.cause, InvocationFailure::Timeout { .. })
    }
}

impl Classify for IntegrationError {
    fn kind(&self) -> ErrorKind {
        self.cause.kind()
    }
}
