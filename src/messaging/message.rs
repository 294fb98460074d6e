//! # Queue Message Structures
//!
//! Wire-stable message and dead-letter records for the work queue.

use crate::constants::defaults;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::time::Duration;
use uuid::Uuid;

/// Unit of work held by a named queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub id: Uuid,
    pub payload: serde_json::Value,
    /// Priority level (higher number = higher priority)
    pub priority: u8,
    /// When the message entered its current queue
    pub enqueue_time: DateTime<Utc>,
    /// Earliest instant the message may be handed to a consumer
    pub visible_after: DateTime<Utc>,
    /// Failed processing attempts so far
    pub retry_count: u32,
    /// Redeliveries allowed before the message is dead-lettered
    pub max_retries: u32,
    /// Message correlation ID for tracking
    pub correlation_id: String,
}

impl QueueMessage {
    /// Create a new message that is visible immediately
    pub fn new(payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payload,
            priority: defaults::MESSAGE_PRIORITY,
            enqueue_time: now,
            visible_after: now,
            retry_count: 0,
            max_retries: defaults::MESSAGE_MAX_RETRIES,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Hold the message back for `delay` after it is published
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.visible_after = self.enqueue_time + chrono_duration(delay);
        self
    }

    /// Whether a consumer may receive the message at `now`
    pub fn is_visible_at(&self, now: DateTime<Utc>) -> bool {
        self.visible_after <= now
    }

    /// Whether another failure would exhaust the retry budget
    pub fn is_final_attempt(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Convert to JSON for storage or transport
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Create from JSON
    pub fn from_json(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Handle proving ownership of one lease on a message.
///
/// Each dequeue mints a fresh `lease_id`; once the visibility timeout lapses and
/// another consumer leases the message, older receipts stop settling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseReceipt {
    pub message_id: Uuid,
    pub lease_id: Uuid,
}

/// A dequeued message together with the receipt needed to settle it
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedMessage {
    pub message: QueueMessage,
    pub receipt: LeaseReceipt,
}

impl LeasedMessage {
    pub fn into_message(self) -> QueueMessage {
        self.message
    }
}

impl Deref for LeasedMessage {
    type Target = QueueMessage;

    fn deref(&self) -> &QueueMessage {
        &self.message
    }
}

/// A message that exhausted its retry budget, kept for inspection and replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    /// The message as it was when it was dead-lettered
    pub message: QueueMessage,
    pub queue_name: String,
    /// Reason given with the final failure
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn message_id(&self) -> Uuid {
        self.message.id
    }
}

/// What `fail` did with a message
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDisposition {
    /// Scheduled for redelivery
    Requeued {
        retry_count: u32,
        visible_after: DateTime<Utc>,
    },
    /// Moved to the queue's dead-letter store
    DeadLettered { retry_count: u32 },
}

impl FailureDisposition {
    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, Self::DeadLettered { .. })
    }
}

/// Point-in-time view of one queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_name: String,
    /// Messages held by the queue, visible or not
    pub depth: usize,
    /// Messages a consumer could receive right now
    pub ready: usize,
    /// Messages leased to a consumer whose visibility timeout has not expired
    pub in_flight: usize,
    /// Messages waiting out a publish delay or redelivery backoff
    pub delayed: usize,
    pub dead_letters: usize,
    pub max_size: usize,
    pub total_published: u64,
    pub total_acknowledged: u64,
    pub total_dead_lettered: u64,
}

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
