//! # Messaging Error Types
//!
//! Structured error types for the in-process message queue.

use crate::error::ErrorKind;
use crate::resilience::Classify;
use thiserror::Error;
use uuid::Uuid;

/// Messaging error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessagingError {
    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Queue already exists: {queue_name}")]
    QueueAlreadyExists { queue_name: String },

    #[error("Invalid queue name: {queue_name}: {reason}")]
    InvalidQueueName { queue_name: String, reason: String },

    #[error("Message {message_id} not found in queue {queue_name}")]
    MessageNotFound { queue_name: String, message_id: Uuid },

    #[error("Message {message_id} in queue {queue_name} is not currently leased")]
    MessageNotInFlight { queue_name: String, message_id: Uuid },

    #[error("Dead letter {message_id} not found for queue {queue_name}")]
    DeadLetterNotFound { queue_name: String, message_id: Uuid },

    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    #[error("Message too large: {size_bytes} bytes exceeds limit of {limit_bytes} bytes")]
    MessageTooLarge {
        size_bytes: usize,
        limit_bytes: usize,
    },

    #[error("Queue capacity exceeded: {queue_name} has {current_count} messages, limit is {limit_count}")]
    QueueCapacityExceeded {
        queue_name: String,
        current_count: usize,
        limit_count: usize,
    },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },
}

impl MessagingError {
    /// Create a queue not found error
    pub fn queue_not_found(queue_name: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue_name: queue_name.into(),
        }
    }

    pub fn queue_already_exists(queue_name: impl Into<String>) -> Self {
        Self::QueueAlreadyExists {
            queue_name: queue_name.into(),
        }
    }

    pub fn invalid_queue_name(queue_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQueueName {
            queue_name: queue_name.into(),
            reason: reason.into(),
        }
    }

    /// Create a message not found error
    pub fn message_not_found(queue_name: impl Into<String>, message_id: Uuid) -> Self {
        Self::MessageNotFound {
            queue_name: queue_name.into(),
            message_id,
        }
    }

    pub fn message_not_in_flight(queue_name: impl Into<String>, message_id: Uuid) -> Self {
        Self::MessageNotInFlight {
            queue_name: queue_name.into(),
            message_id,
        }
    }

    pub fn dead_letter_not_found(queue_name: impl Into<String>, message_id: Uuid) -> Self {
        Self::DeadLetterNotFound {
            queue_name: queue_name.into(),
            message_id,
        }
    }

    /// Create an invalid message error
    pub fn invalid_message(reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            reason: reason.into(),
        }
    }

    /// Create a message serialization error
    pub fn message_serialization(message: impl Into<String>) -> Self {
        Self::MessageSerialization {
            message: message.into(),
        }
    }
}

impl Classify for MessagingError {
    fn kind(&self) -> ErrorKind {
        match self {
            // Consumers drain the queue, so a full queue is backpressure rather than a bad request
            Self::QueueCapacityExceeded { .. } => ErrorKind::System,
            _ => ErrorKind::Permanent,
        }
    }
}

/// Conversion from serde_json::Error to MessagingError
impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::message_serialization(err.to_string())
    }
}

/// Result type alias for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messaging_error_creation() {
        let err = MessagingError::queue_not_found("orders");
        assert!(matches!(err, MessagingError::QueueNotFound { .. }));
        assert_eq!(err.to_string(), "Queue not found: orders");

        let id = Uuid::new_v4();
        let err = MessagingError::message_not_found("orders", id);
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_capacity_is_system_failure() {
        let full = MessagingError::QueueCapacityExceeded {
            queue_name: "orders".to_string(),
            current_count: 10,
            limit_count: 10,
        };
        assert_eq!(full.kind(), ErrorKind::System);
        assert_eq!(
            MessagingError::invalid_message("bad priority").kind(),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn test_serde_error_conversion() {
        let err: MessagingError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert!(matches!(err, MessagingError::MessageSerialization { .. }));
    }
}
