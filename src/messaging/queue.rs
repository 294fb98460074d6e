//! # In-Process Work Queue
//!
//! Named, bounded, priority-aware queues with visibility timeouts and a
//! dead-letter store per queue.
//!
//! Delivery order is `(priority desc, enqueue time asc)` among visible
//! messages. A dequeued message is leased to exactly one consumer until it is
//! acknowledged, failed, or its visibility timeout runs out. Every lease carries
//! a [`LeaseReceipt`]; settling calls must present the receipt of the current
//! lease, so a consumer whose lease lapsed cannot settle a redelivered copy. Failed messages
//! are redelivered after the redelivery policy's backoff while their retry
//! budget lasts, then moved to the dead-letter store where an operator can
//! inspect, replay, or purge them.

use super::errors::{MessagingError, MessagingResult};
use super::message::{
    chrono_duration, DeadLetterRecord, FailureDisposition, LeaseReceipt, LeasedMessage, QueueMessage,
    QueueStats,
};
use crate::config::QueueSettings;
use crate::constants::defaults;
use crate::resilience::RetryPolicy;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_QUEUE_NAME_LENGTH: usize = 128;

type OrderKey = (Reverse<u8>, u64);

#[derive(Debug)]
struct Entry {
    message: QueueMessage,
    order_key: OrderKey,
    /// Id of the current lease, if a consumer holds one
    lease: Option<Uuid>,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<Uuid, Entry>,
    order: BTreeMap<OrderKey, Uuid>,
    dead_letters: Vec<DeadLetterRecord>,
    next_sequence: u64,
    total_published: u64,
    total_acknowledged: u64,
    total_dead_lettered: u64,
}

impl QueueState {
    fn insert(&mut self, message: QueueMessage) {
        let order_key = (Reverse(message.priority), self.next_sequence);
        self.next_sequence += 1;
        self.order.insert(order_key, message.id);
        self.entries.insert(
            message.id,
            Entry {
                message,
                order_key,
                lease: None,
            },
        );
    }

    fn remove(&mut self, id: &Uuid) -> Option<Entry> {
        let entry = self.entries.remove(id)?;
        self.order.remove(&entry.order_key);
        Some(entry)
    }

    /// Lease the best visible message, hiding it until `now + visibility_timeout`
    fn take_visible(&mut self, now: DateTime<Utc>, visibility_timeout: Duration) -> Option<LeasedMessage> {
        let id = *self.order.values().find(|id| {
            self.entries
                .get(id)
                .is_some_and(|entry| entry.message.is_visible_at(now))
        })?;
        let entry = self.entries.get_mut(&id)?;
        let lease_id = Uuid::new_v4();
        entry.lease = Some(lease_id);
        entry.message.visible_after = now + chrono_duration(visibility_timeout);
        Some(LeasedMessage {
            message: entry.message.clone(),
            receipt: LeaseReceipt {
                message_id: id,
                lease_id,
            },
        })
    }

    /// The entry `receipt` points at, provided the receipt's lease is the current one
    fn leased_entry(&mut self, queue_name: &str, receipt: &LeaseReceipt) -> MessagingResult<&mut Entry> {
        let entry = self
            .entries
            .get_mut(&receipt.message_id)
            .ok_or_else(|| MessagingError::message_not_found(queue_name, receipt.message_id))?;
        if entry.lease != Some(receipt.lease_id) {
            return Err(MessagingError::message_not_in_flight(queue_name, receipt.message_id));
        }
        Ok(entry)
    }

    fn next_visible_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.entries
            .values()
            .map(|entry| entry.message.visible_after)
            .filter(|visible_after| *visible_after > now)
            .min()
    }
}

#[derive(Debug)]
struct NamedQueue {
    name: String,
    max_size: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    deleted: AtomicBool,
}

impl NamedQueue {
    fn new(name: String, max_size: usize) -> Self {
        Self {
            name,
            max_size,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            deleted: AtomicBool::new(false),
        }
    }
}

/// Registry of named work queues owned by one instance
#[derive(Debug)]
pub struct MessageQueue {
    queues: DashMap<String, Arc<NamedQueue>>,
    default_max_size: usize,
    default_max_retries: u32,
    visibility_timeout: Duration,
    redelivery: RetryPolicy,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::from_config(&QueueSettings::default())
    }
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue registry from configuration
    pub fn from_config(settings: &QueueSettings) -> Self {
        Self {
            queues: DashMap::new(),
            default_max_size: settings.max_size,
            default_max_retries: settings.max_retries,
            visibility_timeout: settings.visibility_timeout(),
            redelivery: settings.redelivery.to_retry_policy(),
        }
    }

    /// Replace the backoff used between redeliveries of a failed message
    pub fn with_redelivery_policy(mut self, policy: RetryPolicy) -> Self {
        self.redelivery = policy;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.default_max_size = max_size;
        self
    }

    /// Visibility timeout applied by callers that don't pick their own
    pub fn default_visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// `max_retries` for messages built through [`MessageQueue::message`]
    pub fn default_max_retries(&self) -> u32 {
        self.default_max_retries
    }

    /// Build a message carrying this queue registry's default retry budget
    pub fn message(&self, payload: serde_json::Value) -> QueueMessage {
        QueueMessage::new(payload).with_max_retries(self.default_max_retries)
    }

    /// Create a queue with the default capacity
    pub fn create_queue(&self, queue_name: &str) -> MessagingResult<()> {
        self.create_queue_with_capacity(queue_name, self.default_max_size)
    }

    pub fn create_queue_with_capacity(&self, queue_name: &str, max_size: usize) -> MessagingResult<()> {
        Self::validate_queue_name(queue_name)?;
        if max_size == 0 {
            return Err(MessagingError::invalid_queue_name(
                queue_name,
                "queue capacity must be greater than 0",
            ));
        }

        match self.queues.entry(queue_name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(MessagingError::queue_already_exists(queue_name))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(NamedQueue::new(queue_name.to_string(), max_size)));
                info!(queue = %queue_name, max_size = max_size, "📬 Queue created");
                Ok(())
            }
        }
    }

    /// Create the queue unless it already exists
    pub fn ensure_queue(&self, queue_name: &str) -> MessagingResult<()> {
        match self.create_queue(queue_name) {
            Ok(()) | Err(MessagingError::QueueAlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete a queue and its dead letters, returning how many messages were dropped.
    ///
    /// Consumers blocked in `dequeue` on the queue return `QueueNotFound`.
    pub fn delete_queue(&self, queue_name: &str) -> MessagingResult<usize> {
        let (_, queue) = self
            .queues
            .remove(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;

        queue.deleted.store(true, Ordering::Release);
        queue.notify.notify_waiters();

        let dropped = queue.state.lock().entries.len();
        info!(queue = %queue_name, dropped_messages = dropped, "🗑️ Queue deleted");
        Ok(dropped)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|q| q.key().clone()).collect();
        names.sort();
        names
    }

    pub fn queue_exists(&self, queue_name: &str) -> bool {
        self.queues.contains_key(queue_name)
    }

    /// Validate and insert a message, returning its id
    pub fn publish(&self, queue_name: &str, mut message: QueueMessage) -> MessagingResult<Uuid> {
        let queue = self.queue(queue_name)?;
        Self::validate_message(&message)?;

        // Preserve any publish delay relative to the new enqueue time
        let now = Utc::now();
        let delay = (message.visible_after - message.enqueue_time).max(chrono::Duration::zero());
        message.enqueue_time = now;
        message.visible_after = now + delay;

        let message_id = message.id;
        {
            let mut state = queue.state.lock();
            if state.entries.len() >= queue.max_size {
                return Err(MessagingError::QueueCapacityExceeded {
                    queue_name: queue_name.to_string(),
                    current_count: state.entries.len(),
                    limit_count: queue.max_size,
                });
            }
            if state.entries.contains_key(&message_id) {
                return Err(MessagingError::invalid_message(format!(
                    "message {message_id} is already queued"
                )));
            }
            state.insert(message);
            state.total_published += 1;
        }
        queue.notify.notify_waiters();

        debug!(queue = %queue_name, message_id = %message_id, "📨 Message published");
        Ok(message_id)
    }

    /// Lease the highest-priority visible message.
    ///
    /// Waits up to `wait_time` for one to become available and returns `None`
    /// when nothing was ready in time. The returned receipt settles the message
    /// through [`acknowledge`](Self::acknowledge), [`fail`](Self::fail) or
    /// [`extend_visibility`](Self::extend_visibility).
    pub async fn dequeue(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
        wait_time: Duration,
    ) -> MessagingResult<Option<LeasedMessage>> {
        let queue = self.queue(queue_name)?;
        let deadline = Instant::now() + wait_time;

        loop {
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if queue.deleted.load(Ordering::Acquire) {
                return Err(MessagingError::queue_not_found(queue_name));
            }

            let now = Utc::now();
            let next_visible = {
                let mut state = queue.state.lock();
                if let Some(message) = state.take_visible(now, visibility_timeout) {
                    debug!(
                        queue = %queue.name,
                        message_id = %message.id,
                        retry_count = message.retry_count,
                        "📥 Message leased"
                    );
                    return Ok(Some(message));
                }
                state.next_visible_after(now)
            };

            let now_instant = Instant::now();
            if now_instant >= deadline {
                return Ok(None);
            }

            let wake_at = match next_visible {
                Some(visible_at) => {
                    let until = (visible_at - now).to_std().unwrap_or(Duration::ZERO);
                    deadline.min(now_instant + until)
                }
                None => deadline,
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Permanently remove a processed message.
    ///
    /// Fails with `MessageNotInFlight` when `receipt` is not the message's current lease.
    pub fn acknowledge(&self, queue_name: &str, receipt: &LeaseReceipt) -> MessagingResult<()> {
        let queue = self.queue(queue_name)?;
        let message_id = receipt.message_id;
        let mut state = queue.state.lock();
        state.leased_entry(queue_name, receipt)?;
        state.remove(&message_id);
        state.total_acknowledged += 1;

        debug!(queue = %queue_name, message_id = %message_id, "✅ Message acknowledged");
        Ok(())
    }

    /// Record a processing failure.
    ///
    /// While the retry budget lasts the message becomes visible again after
    /// the redelivery backoff; the failure that exceeds `max_retries` moves it
    /// to the dead-letter store. Like [`acknowledge`](Self::acknowledge) it
    /// only accepts the receipt of the current lease.
    pub fn fail(
        &self,
        queue_name: &str,
        receipt: &LeaseReceipt,
        reason: &str,
    ) -> MessagingResult<FailureDisposition> {
        let queue = self.queue(queue_name)?;
        let message_id = receipt.message_id;
        let disposition = {
            let mut state = queue.state.lock();
            let entry = state.leased_entry(queue_name, receipt)?;

            let retries_remaining = entry.message.retry_count < entry.message.max_retries;
            entry.message.retry_count += 1;
            let retry_count = entry.message.retry_count;

            if retries_remaining {
                let delay = self.redelivery.redelivery_delay(retry_count);
                let visible_after = Utc::now() + chrono_duration(delay);
                entry.message.visible_after = visible_after;
                entry.lease = None;

                debug!(
                    queue = %queue_name,
                    message_id = %message_id,
                    retry_count = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "🔁 Message scheduled for redelivery"
                );
                FailureDisposition::Requeued {
                    retry_count,
                    visible_after,
                }
            } else {
                Self::move_to_dead_letters(&mut state, queue_name, message_id, reason);
                FailureDisposition::DeadLettered { retry_count }
            }
        };

        queue.notify.notify_waiters();
        Ok(disposition)
    }

    /// Move a message straight to the dead-letter store, skipping any remaining retries
    pub fn dead_letter(&self, queue_name: &str, message_id: Uuid, reason: &str) -> MessagingResult<()> {
        let queue = self.queue(queue_name)?;
        let mut state = queue.state.lock();
        if !state.entries.contains_key(&message_id) {
            return Err(MessagingError::message_not_found(queue_name, message_id));
        }
        Self::move_to_dead_letters(&mut state, queue_name, message_id, reason);
        Ok(())
    }

    fn move_to_dead_letters(state: &mut QueueState, queue_name: &str, message_id: Uuid, reason: &str) {
        if let Some(entry) = state.remove(&message_id) {
            warn!(
                queue = %queue_name,
                message_id = %message_id,
                retry_count = entry.message.retry_count,
                reason = %reason,
                "☠️ Message moved to dead-letter store"
            );
            state.dead_letters.push(DeadLetterRecord {
                message: entry.message,
                queue_name: queue_name.to_string(),
                reason: reason.to_string(),
                dead_lettered_at: Utc::now(),
            });
            state.total_dead_lettered += 1;
        }
    }

    /// Push a leased message's visibility further out, returning the new deadline.
    ///
    /// The lease must be current and not yet expired.
    pub fn extend_visibility(
        &self,
        queue_name: &str,
        receipt: &LeaseReceipt,
        extension: Duration,
    ) -> MessagingResult<DateTime<Utc>> {
        let queue = self.queue(queue_name)?;
        let mut state = queue.state.lock();
        let entry = state.leased_entry(queue_name, receipt)?;

        let now = Utc::now();
        if entry.message.is_visible_at(now) {
            return Err(MessagingError::message_not_in_flight(queue_name, receipt.message_id));
        }

        entry.message.visible_after += chrono_duration(extension);
        Ok(entry.message.visible_after)
    }

    /// Messages currently held by the queue, visible or not
    pub fn depth(&self, queue_name: &str) -> MessagingResult<usize> {
        Ok(self.queue(queue_name)?.state.lock().entries.len())
    }

    /// Messages leased to a consumer and not yet acknowledged or expired
    pub fn in_flight(&self, queue_name: &str) -> MessagingResult<usize> {
        Ok(self.stats(queue_name)?.in_flight)
    }

    pub fn stats(&self, queue_name: &str) -> MessagingResult<QueueStats> {
        let queue = self.queue(queue_name)?;
        let state = queue.state.lock();
        let now = Utc::now();

        let mut stats = QueueStats {
            queue_name: queue_name.to_string(),
            depth: state.entries.len(),
            dead_letters: state.dead_letters.len(),
            max_size: queue.max_size,
            total_published: state.total_published,
            total_acknowledged: state.total_acknowledged,
            total_dead_lettered: state.total_dead_lettered,
            ..Default::default()
        };
        for entry in state.entries.values() {
            if entry.message.is_visible_at(now) {
                stats.ready += 1;
            } else if entry.lease.is_some() {
                stats.in_flight += 1;
            } else {
                stats.delayed += 1;
            }
        }
        Ok(stats)
    }

    /// Dead-lettered messages in the order they failed
    pub fn dead_letters(&self, queue_name: &str) -> MessagingResult<Vec<DeadLetterRecord>> {
        Ok(self.queue(queue_name)?.state.lock().dead_letters.clone())
    }

    /// Return a dead-lettered message to its queue with a fresh retry budget
    pub fn replay_dead_letter(&self, queue_name: &str, message_id: Uuid) -> MessagingResult<Uuid> {
        let queue = self.queue(queue_name)?;
        {
            let mut state = queue.state.lock();
            let position = state
                .dead_letters
                .iter()
                .position(|record| record.message.id == message_id)
                .ok_or_else(|| MessagingError::dead_letter_not_found(queue_name, message_id))?;

            if state.entries.len() >= queue.max_size {
                return Err(MessagingError::QueueCapacityExceeded {
                    queue_name: queue_name.to_string(),
                    current_count: state.entries.len(),
                    limit_count: queue.max_size,
                });
            }

            let mut message = state.dead_letters.remove(position).message;
            let now = Utc::now();
            message.retry_count = 0;
            message.enqueue_time = now;
            message.visible_after = now;
            state.insert(message);
        }
        queue.notify.notify_waiters();

        info!(queue = %queue_name, message_id = %message_id, "♻️ Dead letter replayed");
        Ok(message_id)
    }

    /// Drop every dead letter of a queue, returning how many were removed
    pub fn purge_dead_letters(&self, queue_name: &str) -> MessagingResult<usize> {
        let queue = self.queue(queue_name)?;
        let purged = std::mem::take(&mut queue.state.lock().dead_letters).len();
        info!(queue = %queue_name, purged = purged, "🧹 Dead letters purged");
        Ok(purged)
    }

    fn queue(&self, queue_name: &str) -> MessagingResult<Arc<NamedQueue>> {
        self.queues
            .get(queue_name)
            .map(|q| q.value().clone())
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))
    }

    fn validate_queue_name(queue_name: &str) -> MessagingResult<()> {
        if queue_name.is_empty() {
            return Err(MessagingError::invalid_queue_name(queue_name, "name is empty"));
        }
        if queue_name.len() > MAX_QUEUE_NAME_LENGTH {
            return Err(MessagingError::invalid_queue_name(
                queue_name,
                format!("name is longer than {MAX_QUEUE_NAME_LENGTH} characters"),
            ));
        }
        if !queue_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(MessagingError::invalid_queue_name(
                queue_name,
                "only ASCII letters, digits, '_', '-' and '.' are allowed",
            ));
        }
        Ok(())
    }

    fn validate_message(message: &QueueMessage) -> MessagingResult<()> {
        if message.priority > defaults::MAX_MESSAGE_PRIORITY {
            return Err(MessagingError::invalid_message(format!(
                "priority {} exceeds maximum of {}",
                message.priority,
                defaults::MAX_MESSAGE_PRIORITY
            )));
        }
        if message.correlation_id.is_empty() {
            return Err(MessagingError::invalid_message("correlation id is empty"));
        }

        let size_bytes = serde_json::to_vec(&message.payload)?.len();
        if size_bytes > defaults::MAX_PAYLOAD_BYTES {
            return Err(MessagingError::MessageTooLarge {
                size_bytes,
                limit_bytes: defaults::MAX_PAYLOAD_BYTES,
            });
        }
        Ok(())
    }
}
