//! Event and delivery record types shared by the bus and its observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Immutable event fanned out to every matching subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    #[serde(rename = "data")]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            source: source.into(),
            payload,
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4().to_string(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A delivery that failed, kept in the failing subscriber's own store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDeadLetter {
    pub id: Uuid,
    pub event: Event,
    pub subscriber_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    Failed { error: String },
    TimedOut { timeout_ms: u64 },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Delivered => None,
            Self::Failed { error } => Some(error.clone()),
            Self::TimedOut { timeout_ms } => Some(format!("handler timed out after {timeout_ms}ms")),
        }
    }
}

/// Outcome of handing one event to one subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberDelivery {
    pub subscriber_id: String,
    pub outcome: DeliveryOutcome,
    pub duration: Duration,
}

/// Per-subscriber outcomes of one publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub event_id: Uuid,
    pub event_type: String,
    pub deliveries: Vec<SubscriberDelivery>,
}

impl PublishReport {
    pub fn delivered_count(&self) -> usize {
        self.deliveries
            .iter()
            .filter(|d| d.outcome.is_delivered())
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.deliveries.len() - self.delivered_count()
    }

    pub fn all_delivered(&self) -> bool {
        self.failed_count() == 0
    }

    pub fn outcome_for(&self, subscriber_id: &str) -> Option<&DeliveryOutcome> {
        self.deliveries
            .iter()
            .find(|d| d.subscriber_id == subscriber_id)
            .map(|d| &d.outcome)
    }
}

/// Subscription statistics
#[derive(Debug, Clone, Default)]
pub struct EventBusStats {
    pub total_subscribers: usize,
    pub total_patterns: usize,
    pub events_published: u64,
    pub subscriber_details: Vec<SubscriberDetail>,
}

/// Individual subscriber details
#[derive(Debug, Clone)]
pub struct SubscriberDetail {
    pub subscriber_id: String,
    pub event_patterns: Vec<String>,
    pub events_received: u64,
    pub events_failed: u64,
    pub dead_letters: usize,
    pub last_event_at: Option<DateTime<Utc>>,
}
