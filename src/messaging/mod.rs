//! # Messaging Module
//!
//! Durable-in-process work queues for orchestration and integration traffic:
//! priority ordering, visibility timeouts, redelivery backoff, and a
//! dead-letter store per queue with operator-triggered replay.

pub mod consumer;
pub mod errors;
pub mod message;
pub mod queue;

pub use consumer::{ConsumerHandle, ConsumerStats, MessageHandler, QueueConsumer};
pub use errors::{MessagingError, MessagingResult};
pub use message::{
    DeadLetterRecord, FailureDisposition, LeaseReceipt, LeasedMessage, QueueMessage, QueueStats,
};
pub use queue::MessageQueue;
