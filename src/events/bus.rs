//! # Event Bus
//!
//! Publish/subscribe fan-out owned by one instance.
//!
//! Every matching subscriber receives each event on its own task with its own
//! timeout, so a slow, failing, or panicking handler never affects delivery to
//! the others. Failed deliveries land in the failing subscriber's dead-letter
//! store, from which an operator can replay them to that subscriber alone.
//! The delivery task records its own outcome, so a publisher that stops
//! waiting (or is cancelled) does not lose the dead letter.
//! External observers can follow the raw event stream through [`EventBus::observe`].

use super::types::{
    DeliveryOutcome, Event, EventBusStats, EventDeadLetter, PublishReport, SubscriberDelivery,
    SubscriberDetail,
};
use crate::config::EventBusSettings;
use crate::error::ErrorKind;
use crate::resilience::Classify;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Events retained for inspection after publishing
const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Trait for event subscribers
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Stable id; owns the subscriber's dead-letter store
    fn subscriber_id(&self) -> &str;

    /// Handle an event; an `Err` is recorded as a failed delivery
    async fn handle_event(&self, event: &Event) -> anyhow::Result<()>;
}

/// Adapts a closure into an [`EventSubscriber`]
pub struct FnSubscriber<F> {
    id: String,
    handler: F,
}

impl<F, Fut> FnSubscriber<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    pub fn new(id: impl Into<String>, handler: F) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            handler,
        })
    }
}

#[async_trait]
impl<F, Fut> EventSubscriber for FnSubscriber<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn subscriber_id(&self) -> &str {
        &self.id
    }

    async fn handle_event(&self, event: &Event) -> anyhow::Result<()> {
        (self.handler)(event.clone()).await
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventBusError {
    #[error("Subscriber not found: {subscriber_id}")]
    SubscriberNotFound { subscriber_id: String },

    #[error("Subscriber {subscriber_id} is already registered with a different handler")]
    SubscriberConflict { subscriber_id: String },

    #[error("Invalid event pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid event: {reason}")]
    InvalidEvent { reason: String },

    #[error("Dead letter {dead_letter_id} not found for subscriber {subscriber_id}")]
    DeadLetterNotFound {
        subscriber_id: String,
        dead_letter_id: Uuid,
    },

    #[error("Delivery of event {event_id} to {subscriber_id} failed: {reason}")]
    DeliveryFailed {
        subscriber_id: String,
        event_id: Uuid,
        reason: String,
    },
}

impl EventBusError {
    pub fn subscriber_not_found(subscriber_id: impl Into<String>) -> Self {
        Self::SubscriberNotFound {
            subscriber_id: subscriber_id.into(),
        }
    }

    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_event(reason: impl Into<String>) -> Self {
        Self::InvalidEvent {
            reason: reason.into(),
        }
    }
}

impl Classify for EventBusError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::DeliveryFailed { .. } => ErrorKind::Transient,
            _ => ErrorKind::Permanent,
        }
    }
}

pub type EventBusResult<T> = Result<T, EventBusError>;

/// Subscription information
#[derive(Clone)]
struct Subscription {
    subscriber: Arc<dyn EventSubscriber>,
    event_patterns: Vec<String>,
    events_received: u64,
    events_failed: u64,
    last_event_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subscriber_id", &self.subscriber.subscriber_id())
            .field("event_patterns", &self.event_patterns)
            .field("events_received", &self.events_received)
            .field("events_failed", &self.events_failed)
            .field("last_event_at", &self.last_event_at)
            .finish()
    }
}

/// Subscriptions and dead letters, shared with in-flight delivery tasks
#[derive(Debug, Default)]
struct DeliveryLedger {
    subscriptions: RwLock<HashMap<String, Subscription>>,
    dead_letters: Mutex<HashMap<String, Vec<EventDeadLetter>>>,
}

impl DeliveryLedger {
    fn record(&self, event: &Event, delivery: &SubscriberDelivery) {
        let failed = !delivery.outcome.is_delivered();
        if let Some(subscription) = self.subscriptions.write().get_mut(&delivery.subscriber_id) {
            subscription.events_received += 1;
            subscription.last_event_at = Some(Utc::now());
            if failed {
                subscription.events_failed += 1;
            }
        }

        if let Some(error) = delivery.outcome.error_message() {
            warn!(
                subscriber_id = %delivery.subscriber_id,
                event_type = %event.event_type,
                event_id = %event.id,
                error = %error,
                "☠️ Event delivery failed, dead-lettered"
            );
            self.dead_letters
                .lock()
                .entry(delivery.subscriber_id.clone())
                .or_default()
                .push(EventDeadLetter {
                    id: Uuid::new_v4(),
                    event: event.clone(),
                    subscriber_id: delivery.subscriber_id.clone(),
                    error,
                    timestamp: Utc::now(),
                });
        }
    }
}

/// Publish/subscribe bus with per-subscriber dead-letter stores
pub struct EventBus {
    ledger: Arc<DeliveryLedger>,
    history: Mutex<VecDeque<Event>>,
    history_capacity: usize,
    observers: broadcast::Sender<Event>,
    handler_timeout: Duration,
    events_published: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.ledger.subscriptions.read().len())
            .field("handler_timeout", &self.handler_timeout)
            .field("events_published", &self.events_published.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::from_config(&EventBusSettings::default())
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(settings: &EventBusSettings) -> Self {
        let (observers, _) = broadcast::channel(settings.observer_channel_capacity.max(1));
        Self {
            ledger: Arc::new(DeliveryLedger::default()),
            history: Mutex::new(VecDeque::new()),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            observers,
            handler_timeout: settings.handler_timeout(),
            events_published: AtomicU64::new(0),
        }
    }

    /// Upper bound on a single handler invocation
    pub fn with_handler_timeout(mut self, handler_timeout: Duration) -> Self {
        self.handler_timeout = handler_timeout;
        self
    }

    pub fn with_history_capacity(mut self, history_capacity: usize) -> Self {
        self.history_capacity = history_capacity;
        self
    }

    /// Register `subscriber` for events matching `pattern`.
    ///
    /// Patterns are exact event types, `"*"`, a prefix wildcard such as
    /// `"workflow.*"`, or a suffix wildcard such as `"*.failed"`. Subscribing
    /// the same subscriber again adds the pattern to its existing subscription.
    pub fn subscribe(&self, pattern: &str, subscriber: Arc<dyn EventSubscriber>) -> EventBusResult<()> {
        Self::validate_pattern(pattern)?;
        let subscriber_id = subscriber.subscriber_id().to_string();
        if subscriber_id.is_empty() {
            return Err(EventBusError::invalid_event("subscriber id must not be empty"));
        }

        let mut subscriptions = self.ledger.subscriptions.write();
        match subscriptions.get_mut(&subscriber_id) {
            Some(existing) => {
                if !Arc::ptr_eq(&existing.subscriber, &subscriber) {
                    return Err(EventBusError::SubscriberConflict { subscriber_id });
                }
                if !existing.event_patterns.iter().any(|p| p == pattern) {
                    existing.event_patterns.push(pattern.to_string());
                }
            }
            None => {
                subscriptions.insert(
                    subscriber_id.clone(),
                    Subscription {
                        subscriber,
                        event_patterns: vec![pattern.to_string()],
                        events_received: 0,
                        events_failed: 0,
                        last_event_at: None,
                    },
                );
            }
        }

        info!(subscriber_id = %subscriber_id, pattern = %pattern, "📡 Subscriber registered");
        Ok(())
    }

    /// Remove a subscriber entirely. Its dead letters are kept for inspection.
    pub fn unsubscribe(&self, subscriber_id: &str) -> EventBusResult<()> {
        self.ledger
            .subscriptions
            .write()
            .remove(subscriber_id)
            .map(|_| info!(subscriber_id = %subscriber_id, "Subscriber unregistered"))
            .ok_or_else(|| EventBusError::subscriber_not_found(subscriber_id))
    }

    /// Remove one pattern; the subscriber goes away with its last pattern
    pub fn unsubscribe_pattern(&self, subscriber_id: &str, pattern: &str) -> EventBusResult<()> {
        let mut subscriptions = self.ledger.subscriptions.write();
        let subscription = subscriptions
            .get_mut(subscriber_id)
            .ok_or_else(|| EventBusError::subscriber_not_found(subscriber_id))?;

        subscription.event_patterns.retain(|p| p != pattern);
        if subscription.event_patterns.is_empty() {
            subscriptions.remove(subscriber_id);
        }
        Ok(())
    }

    pub fn is_subscribed(&self, subscriber_id: &str) -> bool {
        self.ledger.subscriptions.read().contains_key(subscriber_id)
    }

    /// Receiver of every published event, for external observers
    pub fn observe(&self) -> broadcast::Receiver<Event> {
        self.observers.subscribe()
    }

    /// Store `event` and deliver it to every matching subscriber
    #[instrument(skip(self, event), fields(event_type = %event.event_type, event_id = %event.id))]
    pub async fn publish(&self, event: Event) -> EventBusResult<PublishReport> {
        if event.event_type.trim().is_empty() {
            return Err(EventBusError::invalid_event("event type must not be empty"));
        }

        {
            let mut history = self.history.lock();
            if self.history_capacity > 0 {
                if history.len() >= self.history_capacity {
                    history.pop_front();
                }
                history.push_back(event.clone());
            }
        }
        self.events_published.fetch_add(1, Ordering::Relaxed);

        // No observers is fine
        let _ = self.observers.send(event.clone());

        let targets = self.matching_subscribers(&event.event_type);
        if targets.is_empty() {
            debug!("No subscribers found for event type");
        }

        let event = Arc::new(event);
        let mut pending = Vec::with_capacity(targets.len());
        for subscriber in targets {
            let subscriber_id = subscriber.subscriber_id().to_string();
            let task = tokio::spawn(Self::deliver(
                self.ledger.clone(),
                subscriber,
                event.clone(),
                self.handler_timeout,
            ));
            pending.push((subscriber_id, task));
        }

        let mut deliveries = Vec::with_capacity(pending.len());
        for (subscriber_id, task) in pending {
            let delivery = match task.await {
                Ok(delivery) => delivery,
                Err(join_error) => {
                    // The task died before it could record anything
                    let delivery = SubscriberDelivery {
                        subscriber_id: subscriber_id.clone(),
                        outcome: DeliveryOutcome::Failed {
                            error: format!("delivery task aborted: {join_error}"),
                        },
                        duration: Duration::ZERO,
                    };
                    self.ledger.record(&event, &delivery);
                    delivery
                }
            };
            deliveries.push(delivery);
        }

        Ok(PublishReport {
            event_id: event.id,
            event_type: event.event_type.clone(),
            deliveries,
        })
    }

    /// Run one handler and record the outcome in `ledger`
    async fn deliver(
        ledger: Arc<DeliveryLedger>,
        subscriber: Arc<dyn EventSubscriber>,
        event: Arc<Event>,
        handler_timeout: Duration,
    ) -> SubscriberDelivery {
        let started = Instant::now();
        let handled = tokio::time::timeout(
            handler_timeout,
            AssertUnwindSafe(subscriber.handle_event(&event)).catch_unwind(),
        )
        .await;

        let outcome = match handled {
            Ok(Ok(Ok(()))) => DeliveryOutcome::Delivered,
            Ok(Ok(Err(e))) => DeliveryOutcome::Failed {
                error: format!("{e:#}"),
            },
            Ok(Err(panic)) => DeliveryOutcome::Failed {
                error: format!("handler panicked: {}", Self::panic_message(panic.as_ref())),
            },
            Err(_) => DeliveryOutcome::TimedOut {
                timeout_ms: handler_timeout.as_millis() as u64,
            },
        };

        let delivery = SubscriberDelivery {
            subscriber_id: subscriber.subscriber_id().to_string(),
            outcome,
            duration: started.elapsed(),
        };
        ledger.record(&event, &delivery);
        delivery
    }

    fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
        panic
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload")
    }

    /// Failed deliveries for one subscriber, oldest first
    pub fn dead_letters(&self, subscriber_id: &str) -> Vec<EventDeadLetter> {
        self.ledger
            .dead_letters
            .lock()
            .get(subscriber_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Re-deliver one dead letter to its subscriber only.
    ///
    /// The record is removed first; a failed replay records a fresh dead letter.
    pub async fn replay_dead_letter(
        &self,
        subscriber_id: &str,
        dead_letter_id: Uuid,
    ) -> EventBusResult<SubscriberDelivery> {
        let subscriber = self
            .ledger
            .subscriptions
            .read()
            .get(subscriber_id)
            .map(|s| s.subscriber.clone())
            .ok_or_else(|| EventBusError::subscriber_not_found(subscriber_id))?;

        let record = {
            let mut dead_letters = self.ledger.dead_letters.lock();
            let records = dead_letters.get_mut(subscriber_id);
            let position = records
                .as_ref()
                .and_then(|records| records.iter().position(|r| r.id == dead_letter_id));
            match (records, position) {
                (Some(records), Some(position)) => records.remove(position),
                _ => {
                    return Err(EventBusError::DeadLetterNotFound {
                        subscriber_id: subscriber_id.to_string(),
                        dead_letter_id,
                    })
                }
            }
        };

        info!(
            subscriber_id = %subscriber_id,
            event_id = %record.event.id,
            "♻️ Replaying dead-lettered event"
        );

        let delivery = Self::deliver(
            self.ledger.clone(),
            subscriber,
            Arc::new(record.event.clone()),
            self.handler_timeout,
        )
        .await;

        match delivery.outcome.error_message() {
            None => Ok(delivery),
            Some(reason) => Err(EventBusError::DeliveryFailed {
                subscriber_id: subscriber_id.to_string(),
                event_id: record.event.id,
                reason,
            }),
        }
    }

    /// Drop a subscriber's dead letters, returning how many were removed
    pub fn purge_dead_letters(&self, subscriber_id: &str) -> usize {
        self.ledger
            .dead_letters
            .lock()
            .remove(subscriber_id)
            .map(|records| records.len())
            .unwrap_or(0)
    }

    /// Most recent events, newest last
    pub fn recent_events(&self, limit: usize) -> Vec<Event> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> EventBusStats {
        let subscriptions = self.ledger.subscriptions.read();
        let dead_letters = self.ledger.dead_letters.lock();

        let mut stats = EventBusStats {
            total_subscribers: subscriptions.len(),
            events_published: self.events_published.load(Ordering::Relaxed),
            ..Default::default()
        };

        for (subscriber_id, subscription) in subscriptions.iter() {
            stats.total_patterns += subscription.event_patterns.len();
            stats.subscriber_details.push(SubscriberDetail {
                subscriber_id: subscriber_id.clone(),
                event_patterns: subscription.event_patterns.clone(),
                events_received: subscription.events_received,
                events_failed: subscription.events_failed,
                dead_letters: dead_letters.get(subscriber_id).map_or(0, Vec::len),
                last_event_at: subscription.last_event_at,
            });
        }
        stats
            .subscriber_details
            .sort_by(|a, b| a.subscriber_id.cmp(&b.subscriber_id));
        stats
    }

    fn matching_subscribers(&self, event_type: &str) -> Vec<Arc<dyn EventSubscriber>> {
        let subscriptions = self.ledger.subscriptions.read();
        let mut matching: Vec<_> = subscriptions
            .iter()
            .filter(|(_, s)| {
                s.event_patterns
                    .iter()
                    .any(|pattern| Self::matches_pattern(event_type, pattern))
            })
            .map(|(id, s)| (id.clone(), s.subscriber.clone()))
            .collect();
        // Deterministic delivery order in reports
        matching.sort_by(|a, b| a.0.cmp(&b.0));
        matching.into_iter().map(|(_, s)| s).collect()
    }

    /// Check if event type matches a pattern
    fn matches_pattern(event_type: &str, pattern: &str) -> bool {
        if pattern == "*" {
            true
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            event_type.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            event_type.ends_with(suffix)
        } else {
            event_type == pattern
        }
    }

    fn validate_pattern(pattern: &str) -> EventBusResult<()> {
        if pattern.trim().is_empty() {
            return Err(EventBusError::invalid_pattern(pattern, "pattern is empty"));
        }
        let wildcards = pattern.matches('*').count();
        let anchored = pattern.starts_with('*') || pattern.ends_with('*');
        if wildcards > 1 || (wildcards == 1 && !anchored) {
            return Err(EventBusError::invalid_pattern(
                pattern,
                "a single '*' is allowed, at the start or end",
            ));
        }
        Ok(())
    }
}
