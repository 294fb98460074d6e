//! # Queue Consumer
//!
//! Polling loop that feeds messages from one named queue to a handler,
//! acknowledging on success and failing (redelivery / dead-letter) on error.
//!
//! Up to `concurrency` messages are handled at once. The loop only leases a
//! message after taking a slot in its own resource pool, so nothing sits
//! leased while waiting for a free handler.

use super::errors::MessagingError;
use super::message::{LeasedMessage, QueueMessage};
use super::queue::MessageQueue;
use crate::constants::defaults;
use crate::resilience::{ResourcePermit, ResourcePool};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Processes one message; an `Err` counts as a processing failure
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &QueueMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(QueueMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: &QueueMessage) -> anyhow::Result<()> {
        (self)(message.clone()).await
    }
}

/// Counters reported when a consumer stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub processed: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Default)]
struct ConsumerCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
}

impl ConsumerCounters {
    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Configuration for a single consumer loop
#[derive(Clone)]
pub struct QueueConsumer {
    queue: Arc<MessageQueue>,
    queue_name: String,
    handler: Arc<dyn MessageHandler>,
    visibility_timeout: Duration,
    poll_interval: Duration,
    concurrency: usize,
}

impl std::fmt::Debug for QueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConsumer")
            .field("queue_name", &self.queue_name)
            .field("visibility_timeout", &self.visibility_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl QueueConsumer {
    pub fn new(
        queue: Arc<MessageQueue>,
        queue_name: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let visibility_timeout = queue.default_visibility_timeout();
        Self {
            queue,
            queue_name: queue_name.into(),
            handler,
            visibility_timeout,
            poll_interval: defaults::CONSUMER_POLL_INTERVAL,
            concurrency: defaults::CONSUMER_CONCURRENCY,
        }
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    /// How long each dequeue waits for a message before checking for shutdown
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Messages handled at the same time; at least one
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Start the loop on the tokio runtime
    pub fn spawn(self) -> ConsumerHandle {
        let cancel = CancellationToken::new();
        let counters = Arc::new(ConsumerCounters::default());
        let join = tokio::spawn(self.run(cancel.clone(), counters.clone()));
        ConsumerHandle {
            cancel,
            counters,
            join,
        }
    }

    async fn run(
        self,
        cancel: CancellationToken,
        counters: Arc<ConsumerCounters>,
    ) -> Result<(), MessagingError> {
        info!(
            queue = %self.queue_name,
            concurrency = self.concurrency,
            "🚀 Queue consumer started"
        );

        let slots = ResourcePool::new(format!("consumer.{}", self.queue_name), self.concurrency);
        let consumer = Arc::new(self);
        let mut in_progress = JoinSet::new();

        let result = loop {
            while let Some(joined) = in_progress.try_join_next() {
                Self::log_join_error(&consumer.queue_name, joined);
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                permit = slots.acquire(Duration::MAX) => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!(queue = %consumer.queue_name, error = %e, "❌ Consumer slot pool closed");
                        break Ok(());
                    }
                },
            };

            let dequeued = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                result = consumer.queue.dequeue(&consumer.queue_name, consumer.visibility_timeout, consumer.poll_interval) => result,
            };

            match dequeued {
                Ok(Some(leased)) => {
                    in_progress.spawn(consumer.clone().process(leased, counters.clone(), permit));
                }
                Ok(None) => continue,
                Err(e) => {
                    error!(queue = %consumer.queue_name, error = %e, "❌ Queue consumer stopping");
                    break Err(e);
                }
            }
        };

        // Messages in hand are always finished before shutdown is honoured
        while let Some(joined) = in_progress.join_next().await {
            Self::log_join_error(&consumer.queue_name, joined);
        }

        info!(queue = %consumer.queue_name, "🛑 Queue consumer stopped");
        result
    }

    async fn process(
        self: Arc<Self>,
        leased: LeasedMessage,
        counters: Arc<ConsumerCounters>,
        _slot: ResourcePermit,
    ) {
        let LeasedMessage { message, receipt } = leased;

        match self.handler.handle(&message).await {
            Ok(()) => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.queue.acknowledge(&self.queue_name, &receipt) {
                    // Lease expired and another consumer already took it
                    warn!(queue = %self.queue_name, message_id = %message.id, error = %e, "Acknowledge failed");
                }
            }
            Err(handler_error) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                let reason = format!("{handler_error:#}");
                debug!(queue = %self.queue_name, message_id = %message.id, error = %reason, "Handler failed");

                match self.queue.fail(&self.queue_name, &receipt, &reason) {
                    Ok(disposition) if disposition.is_dead_lettered() => {
                        counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(queue = %self.queue_name, message_id = %message.id, error = %e, "Failing message failed");
                    }
                }
            }
        }
    }

    fn log_join_error(queue_name: &str, joined: Result<(), tokio::task::JoinError>) {
        if let Err(join_error) = joined {
            // The lease of a panicked handler lapses and the message is redelivered
            error!(queue = %queue_name, error = %join_error, "Message handler task panicked");
        }
    }
}

/// Running consumer; dropping it leaves the loop running
#[derive(Debug)]
pub struct ConsumerHandle {
    cancel: CancellationToken,
    counters: Arc<ConsumerCounters>,
    join: JoinHandle<Result<(), MessagingError>>,
}

impl ConsumerHandle {
    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop the loop after any in-progress message and return final counters
    pub async fn shutdown(self) -> Result<ConsumerStats, MessagingError> {
        self.cancel.cancel();
        match self.join.await {
            Ok(result) => result.map(|()| self.counters.snapshot()),
            Err(join_error) => {
                error!(error = %join_error, "Queue consumer task panicked");
                Ok(self.counters.snapshot())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::RetryPolicy;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn queue() -> Arc<MessageQueue> {
        let queue = MessageQueue::new().with_redelivery_policy(
            RetryPolicy::default()
                .with_delays(Duration::from_millis(5), Duration::from_millis(5))
                .with_jitter(false),
        );
        queue.create_queue("jobs").unwrap();
        Arc::new(queue)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_consumer_acknowledges_processed_messages() {
        let queue = queue();
        for i in 0..5 {
            queue.publish("jobs", QueueMessage::new(json!(i))).unwrap();
        }

        let handler: Arc<dyn MessageHandler> = Arc::new(|_message: QueueMessage| async { Ok(()) });
        let handle = QueueConsumer::new(queue.clone(), "jobs", handler)
            .with_poll_interval(Duration::from_millis(10))
            .spawn();

        wait_until(|| queue.depth("jobs").unwrap() == 0).await;
        let stats = handle.shutdown().await.unwrap();
        assert_eq!(stats.processed, 5);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_consumer_dead_letters_poison_message() {
        let queue = queue();
        queue
            .publish("jobs", QueueMessage::new(json!("poison")).with_max_retries(1))
            .unwrap();

        let handler: Arc<dyn MessageHandler> =
            Arc::new(|_message: QueueMessage| async { Err(anyhow::anyhow!("cannot parse")) });
        let handle = QueueConsumer::new(queue.clone(), "jobs", handler)
            .with_poll_interval(Duration::from_millis(10))
            .spawn();

        wait_until(|| queue.dead_letters("jobs").unwrap().len() == 1).await;
        let stats = handle.shutdown().await.unwrap();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(queue.dead_letters("jobs").unwrap()[0].reason, "cannot parse");
    }

    #[tokio::test]
    async fn test_consumer_handles_messages_concurrently() {
        let queue = queue();
        for i in 0..6 {
            queue.publish("jobs", QueueMessage::new(json!(i))).unwrap();
        }

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handler: Arc<dyn MessageHandler> = {
            let active = active.clone();
            let peak = peak.clone();
            Arc::new(move |_message: QueueMessage| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        let handle = QueueConsumer::new(queue.clone(), "jobs", handler)
            .with_poll_interval(Duration::from_millis(10))
            .with_concurrency(3)
            .spawn();

        wait_until(|| queue.depth("jobs").unwrap() == 0).await;
        let stats = handle.shutdown().await.unwrap();
        assert_eq!(stats.processed, 6);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_shutdown_finishes_messages_in_hand() {
        let queue = queue();
        for i in 0..2 {
            queue.publish("jobs", QueueMessage::new(json!(i))).unwrap();
        }

        let started = Arc::new(AtomicUsize::new(0));
        let handler: Arc<dyn MessageHandler> = {
            let started = started.clone();
            Arc::new(move |_message: QueueMessage| {
                started.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                }
            })
        };
        let handle = QueueConsumer::new(queue.clone(), "jobs", handler)
            .with_poll_interval(Duration::from_millis(10))
            .with_concurrency(2)
            .spawn();

        wait_until(|| started.load(Ordering::SeqCst) == 2).await;
        let stats = handle.shutdown().await.unwrap();
        assert_eq!(stats.processed, 2);
        assert_eq!(queue.depth("jobs").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_consumer_stops_when_queue_deleted() {
        let queue = queue();
        let handler: Arc<dyn MessageHandler> = Arc::new(|_message: QueueMessage| async { Ok(()) });
        let handle = QueueConsumer::new(queue.clone(), "jobs", handler)
            .with_poll_interval(Duration::from_secs(1))
            .spawn();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.delete_queue("jobs").unwrap();

        wait_until(|| handle.is_finished()).await;
        assert!(matches!(
            handle.shutdown().await,
            Err(MessagingError::QueueNotFound { .. })
        ));
    }
}
