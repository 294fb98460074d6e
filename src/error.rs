//! # Error Handling
//!
//! Crate-level error type and the failure taxonomy shared by every component.
//!
//! Each component owns a structured error enum (see `resilience`, `messaging`,
//! `events`, `integration` and `orchestration`); all of them convert into
//! [`TaskerError`] so callers composing several components can use `?` freely.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ConfigurationError;
use crate::events::EventBusError;
use crate::integration::IntegrationError;
use crate::messaging::MessagingError;
use crate::orchestration::WorkflowError;
use crate::resilience::BulkheadError;

/// Failure classes used to decide whether work may be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts, connection failures, 5xx-equivalents. Retried within policy limits.
    Transient,
    /// Validation failures, 4xx-equivalents, invalid definitions. Never retried.
    Permanent,
    /// Resource exhaustion or an open circuit. The caller may resubmit later,
    /// but the current call is not retried automatically.
    System,
}

impl ErrorKind {
    /// Whether a failure of this kind is retried by the retry executor
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::System => write!(f, "system"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskerError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Resource pool error: {0}")]
    Bulkhead(#[from] BulkheadError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("Integration error: {0}")]
    Integration(#[from] IntegrationError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TaskerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(!ErrorKind::Permanent.is_retryable());
        assert!(!ErrorKind::System.is_retryable());
    }

    #[test]
    fn test_error_conversion_into_tasker_error() {
        let err: TaskerError = MessagingError::queue_not_found("orders").into();
        assert!(matches!(err, TaskerError::Messaging(_)));
        assert!(err.to_string().contains("orders"));
    }
}
