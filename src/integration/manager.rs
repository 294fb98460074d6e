//! # Integration Manager
//!
//! Routes every outbound call to a registered worker through the same guard
//! rails: the target's circuit breaker admits (or rejects) the call, the retry
//! executor drives attempts under the target's policy, an optional bulkhead
//! bounds concurrency per resource class, and each attempt carries a timeout.
//!
//! The transport is picked per call:
//!
//! - **Direct**: the worker is called in-line
//! - **Queued**: the request is published to `integration.<target>` and handed
//!   to the worker by a lazily started [`QueueConsumer`]; a final failed attempt
//!   lands in that queue's dead-letter store
//! - **Event**: the request is published as `integration.<target>.invoke` and
//!   answered by the target's bus subscriber; failed deliveries land in that
//!   subscriber's dead-letter store
//! - **Stream**: the worker's chunks are collected into a JSON array
//!
//! Lifecycle events (`integration.invoked`, `integration.completed`,
//! `integration.failed`, `integration.circuit_state_changed`) are published on
//! the event bus for external observers.

use super::errors::{IntegrationError, InvocationFailure};
use super::strategy::InvocationStrategy;
use super::worker::{InvocationRequest, Worker, WorkerError};
use crate::config::TaskerFlowConfig;
use crate::constants::{events, sources};
use crate::events::{DeliveryOutcome, Event, EventBus, EventSubscriber};
use crate::messaging::{
    ConsumerHandle, MessageHandler, MessageQueue, MessagingError, QueueConsumer, QueueMessage,
};
use crate::resilience::{
    BulkheadRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitState,
    CircuitStateTransition, Classify, RetryExecutor, RetryPolicy,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

type Reply = Result<Value, WorkerError>;

/// Replies awaited by queued and event invocations, keyed by message/event id
type PendingReplies = Arc<DashMap<Uuid, oneshot::Sender<Reply>>>;

/// Registration of one worker
#[derive(Clone)]
pub struct IntegrationTarget {
    pub id: String,
    pub worker: Arc<dyn Worker>,
    pub retry_policy: RetryPolicy,
    /// `None` uses the manager's configured thresholds for this id
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Bulkhead class bounding concurrent calls to this target
    pub resource_class: Option<String>,
    /// Strategy used by [`IntegrationManager::invoke`]
    pub strategy: InvocationStrategy,
}

impl std::fmt::Debug for IntegrationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationTarget")
            .field("id", &self.id)
            .field("retry_policy", &self.retry_policy)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("resource_class", &self.resource_class)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl IntegrationTarget {
    pub fn new(id: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        Self {
            id: id.into(),
            worker,
            retry_policy: RetryPolicy::default(),
            circuit_breaker: None,
            resource_class: None,
            strategy: InvocationStrategy::Direct,
        }
    }

    /// Build a target from the `targets.<id>` section, falling back to global defaults
    pub fn from_config(id: impl Into<String>, worker: Arc<dyn Worker>, config: &TaskerFlowConfig) -> Self {
        let id = id.into();
        let settings = config.targets.get(&id);
        let resource_class = settings.and_then(|s| s.resource_class.clone());
        let strategy = settings.and_then(|s| s.strategy).unwrap_or_default();

        Self {
            retry_policy: config.retry_policy_for_target(&id),
            circuit_breaker: Some(config.breaker_config_for_target(&id).to_resilience_config()),
            resource_class,
            strategy,
            worker,
            id,
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn with_resource_class(mut self, resource_class: impl Into<String>) -> Self {
        self.resource_class = Some(resource_class.into());
        self
    }

    pub fn with_strategy(mut self, strategy: InvocationStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

struct RegisteredTarget {
    id: String,
    worker: Arc<dyn Worker>,
    retry_policy: RetryPolicy,
    breaker: Option<Arc<CircuitBreaker>>,
    resource_class: Option<String>,
    strategy: InvocationStrategy,
    queue_name: String,
    subscriber_id: String,
}

/// Request envelope carried in a queued invocation's payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueuedInvocation {
    target_id: String,
    payload: Value,
    attempt: u32,
    timeout_ms: u64,
    /// Failure of this attempt ends the invocation; the message is dead-lettered
    final_attempt: bool,
}

/// Removes a pending reply slot when the awaiting attempt finishes or is dropped
struct PendingGuard<'a> {
    pending: &'a PendingReplies,
    id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Hands queued invocations to the worker and routes the reply back
struct QueuedInvocationHandler {
    worker: Arc<dyn Worker>,
    pending: PendingReplies,
}

#[async_trait]
impl MessageHandler for QueuedInvocationHandler {
    async fn handle(&self, message: &QueueMessage) -> anyhow::Result<()> {
        let envelope: QueuedInvocation = serde_json::from_value(message.payload.clone())?;
        let timeout = Duration::from_millis(envelope.timeout_ms);
        let request = InvocationRequest {
            target_id: envelope.target_id,
            payload: envelope.payload,
            timeout,
            correlation_id: message.correlation_id.clone(),
            attempt: envelope.attempt,
        };

        let reply = tokio::time::timeout(timeout, self.worker.invoke(request))
            .await
            .unwrap_or_else(|_| {
                Err(WorkerError::transient(format!(
                    "queued invocation timed out after {}ms",
                    envelope.timeout_ms
                )))
            });

        // A retryable failure with attempts left is retried by the caller with a fresh message
        let outcome = match &reply {
            Err(e) if envelope.final_attempt || !e.is_retryable() => Err(anyhow::Error::new(e.clone())),
            _ => Ok(()),
        };

        if let Some((_, sender)) = self.pending.remove(&message.id) {
            let _ = sender.send(reply);
        }
        outcome
    }
}

/// Answers invocation events published for one target
struct EventInvocationSubscriber {
    subscriber_id: String,
    target_id: String,
    worker: Arc<dyn Worker>,
    pending: PendingReplies,
}

#[async_trait]
impl EventSubscriber for EventInvocationSubscriber {
    fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    async fn handle_event(&self, event: &Event) -> anyhow::Result<()> {
        let request = InvocationRequest {
            target_id: self.target_id.clone(),
            payload: event.payload.get("payload").cloned().unwrap_or(Value::Null),
            timeout: event
                .payload
                .get("timeoutMs")
                .and_then(Value::as_u64)
                .map(Duration::from_millis)
                .unwrap_or(crate::constants::defaults::STEP_TIMEOUT),
            correlation_id: event.correlation_id.clone(),
            attempt: event
                .payload
                .get("attempt")
                .and_then(Value::as_u64)
                .unwrap_or(1) as u32,
        };

        let reply = self.worker.invoke(request).await;
        let outcome = match &reply {
            Ok(_) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e.clone())),
        };

        if let Some((_, sender)) = self.pending.remove(&event.id) {
            let _ = sender.send(reply);
        }
        outcome
    }
}

/// Owns the targets, breakers and bulkheads of one integration surface
pub struct IntegrationManager {
    targets: DashMap<String, Arc<RegisteredTarget>>,
    breakers: CircuitBreakerManager,
    breakers_enabled: bool,
    bulkheads: BulkheadRegistry,
    queue: Arc<MessageQueue>,
    event_bus: Arc<EventBus>,
    retry_executor: RetryExecutor,
    pending: PendingReplies,
    consumers: Mutex<HashMap<String, ConsumerHandle>>,
    transitions: Mutex<broadcast::Receiver<CircuitStateTransition>>,
    consumer_poll_interval: Duration,
    consumer_concurrency: usize,
    config: TaskerFlowConfig,
}

impl std::fmt::Debug for IntegrationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationManager")
            .field("targets", &self.target_ids())
            .field("breakers_enabled", &self.breakers_enabled)
            .field("pending_replies", &self.pending.len())
            .finish()
    }
}

impl IntegrationManager {
    /// Manager with default configuration
    pub fn new(event_bus: Arc<EventBus>, queue: Arc<MessageQueue>) -> Self {
        Self::from_config(&TaskerFlowConfig::default(), event_bus, queue)
    }

    pub fn from_config(
        config: &TaskerFlowConfig,
        event_bus: Arc<EventBus>,
        queue: Arc<MessageQueue>,
    ) -> Self {
        let breakers = CircuitBreakerManager::from_config(&config.circuit_breakers);
        let transitions = Mutex::new(breakers.subscribe_transitions());

        info!(
            circuit_breakers_enabled = config.circuit_breakers.enabled,
            configured_targets = config.targets.len(),
            "🔌 Integration manager initialized"
        );

        Self {
            targets: DashMap::new(),
            breakers,
            breakers_enabled: config.circuit_breakers.enabled,
            bulkheads: BulkheadRegistry::from_config(&config.resource_pools),
            queue,
            event_bus,
            retry_executor: RetryExecutor::new("integration_manager"),
            pending: Arc::new(DashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            transitions,
            consumer_poll_interval: config.queues.poll_interval(),
            consumer_concurrency: config.queues.consumer_concurrency,
            config: config.clone(),
        }
    }

    /// Queue carrying queued invocations for a target
    pub fn queue_name_for(target_id: &str) -> String {
        format!("integration.{target_id}")
    }

    /// Bus subscriber answering event invocations for a target
    pub fn subscriber_id_for(target_id: &str) -> String {
        format!("integration.{target_id}")
    }

    /// Register a worker using the `targets.<id>` configuration
    pub fn register_worker(
        &self,
        target_id: impl Into<String>,
        worker: Arc<dyn Worker>,
    ) -> Result<(), IntegrationError> {
        self.register_target(IntegrationTarget::from_config(target_id, worker, &self.config))
    }

    pub fn register_target(&self, target: IntegrationTarget) -> Result<(), IntegrationError> {
        if self.targets.contains_key(&target.id) {
            return Err(IntegrationError::new(
                target.id,
                0,
                InvocationFailure::TargetAlreadyRegistered,
            ));
        }

        let subscriber_id = Self::subscriber_id_for(&target.id);
        let subscriber = Arc::new(EventInvocationSubscriber {
            subscriber_id: subscriber_id.clone(),
            target_id: target.id.clone(),
            worker: target.worker.clone(),
            pending: self.pending.clone(),
        });
        self.event_bus
            .subscribe(&events::invocation_event_type(&target.id), subscriber)
            .map_err(|e| IntegrationError::new(target.id.clone(), 0, e.into()))?;

        let breaker = self.breakers_enabled.then(|| {
            let config = target
                .circuit_breaker
                .unwrap_or_else(|| self.breakers.config_for_component(&target.id));
            self.breakers.register(&target.id, config)
        });

        info!(
            target_id = %target.id,
            strategy = %target.strategy,
            resource_class = ?target.resource_class,
            max_attempts = target.retry_policy.max_attempts,
            "✅ Integration target registered"
        );

        let registered = RegisteredTarget {
            queue_name: Self::queue_name_for(&target.id),
            subscriber_id,
            id: target.id.clone(),
            worker: target.worker,
            retry_policy: target.retry_policy,
            breaker,
            resource_class: target.resource_class,
            strategy: target.strategy,
        };
        self.targets.insert(target.id, Arc::new(registered));
        Ok(())
    }

    /// Remove a target, stopping its queue consumer and event subscription
    pub async fn unregister_target(&self, target_id: &str) -> Result<(), IntegrationError> {
        let (_, target) = self
            .targets
            .remove(target_id)
            .ok_or_else(|| IntegrationError::target_not_found(target_id))?;

        let _ = self.event_bus.unsubscribe(&target.subscriber_id);
        self.breakers.remove(target_id);

        let consumer = self.consumers.lock().remove(target_id);
        if let Some(consumer) = consumer {
            if let Err(e) = consumer.shutdown().await {
                warn!(target_id = %target_id, error = %e, "Queue consumer stopped with error");
            }
        }

        info!(target_id = %target_id, "Integration target unregistered");
        Ok(())
    }

    pub fn has_target(&self, target_id: &str) -> bool {
        self.targets.contains_key(target_id)
    }

    pub fn target_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.targets.iter().map(|t| t.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Breaker guarding a target, if breakers are enabled
    pub fn circuit_breaker(&self, target_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.targets.get(target_id).and_then(|t| t.breaker.clone())
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerManager {
        &self.breakers
    }

    pub fn bulkheads(&self) -> &BulkheadRegistry {
        &self.bulkheads
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Invoke a target with its registered strategy
    pub async fn invoke(
        &self,
        target_id: &str,
        payload: Value,
        timeout: Duration,
        correlation_id: &str,
    ) -> Result<Value, IntegrationError> {
        let strategy = self
            .targets
            .get(target_id)
            .map(|t| t.strategy)
            .ok_or_else(|| IntegrationError::target_not_found(target_id))?;
        self.invoke_with_strategy(target_id, payload, timeout, correlation_id, strategy)
            .await
    }

    /// Invoke a target over an explicit transport
    #[instrument(skip_all, fields(target_id = %target_id, strategy = %strategy, correlation_id = %correlation_id))]
    pub async fn invoke_with_strategy(
        &self,
        target_id: &str,
        payload: Value,
        timeout: Duration,
        correlation_id: &str,
        strategy: InvocationStrategy,
    ) -> Result<Value, IntegrationError> {
        let target = self
            .targets
            .get(target_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| IntegrationError::target_not_found(target_id))?;
        let started = Instant::now();

        let permit = match &target.breaker {
            Some(breaker) => match breaker.try_acquire() {
                Some(permit) => Some(permit),
                None => {
                    warn!("🔴 Circuit open, failing fast");
                    let error = IntegrationError::circuit_open(target_id);
                    self.publish_failed(&target, strategy, correlation_id, &error, started)
                        .await;
                    return Err(error);
                }
            },
            None => None,
        };

        self.publish_lifecycle(
            events::INTEGRATION_INVOKED,
            correlation_id,
            json!({
                "targetId": target.id,
                "strategy": strategy,
                "trialCall": permit.as_ref().is_some_and(|p| p.is_trial()),
            }),
        )
        .await;

        let attempts = AtomicU32::new(0);
        let outcome = self
            .retry_executor
            .execute_with_retry(&target.retry_policy, |attempt| {
                attempts.store(attempt, Ordering::Relaxed);
                let request = InvocationRequest {
                    target_id: target.id.clone(),
                    payload: payload.clone(),
                    timeout,
                    correlation_id: correlation_id.to_string(),
                    attempt,
                };
                self.attempt(&target, strategy, request)
            })
            .await;

        let result = match outcome {
            Ok(value) => {
                if let Some(permit) = permit {
                    permit.record_success();
                }
                Ok(value)
            }
            Err(retry_error) => {
                let attempts = retry_error.attempts();
                let cause = retry_error.into_inner();
                if let Some(permit) = permit {
                    if Self::counts_against_target(&cause) {
                        permit.record_failure();
                    }
                }
                Err(IntegrationError::new(target_id, attempts, cause))
            }
        };

        self.forward_circuit_transitions().await;

        match &result {
            Ok(_) => {
                debug!(
                    attempts = attempts.load(Ordering::Relaxed),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Invocation completed"
                );
                self.publish_lifecycle(
                    events::INTEGRATION_COMPLETED,
                    correlation_id,
                    json!({
                        "targetId": target.id,
                        "strategy": strategy,
                        "attempts": attempts.load(Ordering::Relaxed),
                        "durationMs": started.elapsed().as_millis() as u64,
                    }),
                )
                .await;
            }
            Err(error) => {
                warn!(attempts = error.attempts, error = %error.cause, kind = %error.kind(), "❌ Invocation failed");
                self.publish_failed(&target, strategy, correlation_id, error, started)
                    .await;
            }
        }

        result
    }

    /// Stop every queue consumer started for queued invocations
    pub async fn shutdown(&self) {
        let consumers: Vec<(String, ConsumerHandle)> = self.consumers.lock().drain().collect();
        for (target_id, consumer) in consumers {
            match consumer.shutdown().await {
                Ok(stats) => debug!(
                    target_id = %target_id,
                    processed = stats.processed,
                    failed = stats.failed,
                    "Queue consumer stopped"
                ),
                Err(e) => warn!(target_id = %target_id, error = %e, "Queue consumer stopped with error"),
            }
        }
        info!("🛑 Integration manager shut down");
    }

    /// Local admission failures say nothing about the target's health
    fn counts_against_target(cause: &InvocationFailure) -> bool {
        !matches!(
            cause,
            InvocationFailure::CircuitOpen | InvocationFailure::ResourceExhausted(_)
        )
    }

    async fn attempt(
        &self,
        target: &RegisteredTarget,
        strategy: InvocationStrategy,
        request: InvocationRequest,
    ) -> Result<Value, InvocationFailure> {
        // Another caller may have tripped the breaker since admission
        if let Some(breaker) = &target.breaker {
            if breaker.state() == CircuitState::Open {
                return Err(InvocationFailure::CircuitOpen);
            }
        }

        let _permit = match &target.resource_class {
            Some(class) => Some(self.bulkheads.acquire(class).await?),
            None => None,
        };

        let timeout = request.timeout;
        match tokio::time::timeout(timeout, self.dispatch(target, strategy, request)).await {
            Ok(result) => result,
            Err(_) => Err(InvocationFailure::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn dispatch(
        &self,
        target: &RegisteredTarget,
        strategy: InvocationStrategy,
        request: InvocationRequest,
    ) -> Result<Value, InvocationFailure> {
        match strategy {
            InvocationStrategy::Direct => Ok(target.worker.invoke(request).await?),
            InvocationStrategy::Stream => {
                let mut stream = target.worker.invoke_stream(request);
                let mut chunks = Vec::new();
                while let Some(chunk) = stream.next().await {
                    chunks.push(chunk?);
                }
                Ok(Value::Array(chunks))
            }
            InvocationStrategy::Queued => self.invoke_queued(target, request).await,
            InvocationStrategy::Event => self.invoke_event(target, request).await,
        }
    }

    async fn invoke_queued(
        &self,
        target: &RegisteredTarget,
        request: InvocationRequest,
    ) -> Result<Value, InvocationFailure> {
        self.ensure_consumer(target)?;

        let envelope = QueuedInvocation {
            target_id: target.id.clone(),
            payload: request.payload,
            attempt: request.attempt,
            timeout_ms: request.timeout.as_millis() as u64,
            final_attempt: request.attempt >= target.retry_policy.max_attempts,
        };
        let payload = serde_json::to_value(&envelope).map_err(MessagingError::from)?;
        // Redelivery is driven by the retry executor, so the queue never redelivers
        let message = self
            .queue
            .message(payload)
            .with_correlation_id(request.correlation_id)
            .with_max_retries(0);

        let (sender, receiver) = oneshot::channel();
        self.pending.insert(message.id, sender);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: message.id,
        };

        self.queue.publish(&target.queue_name, message)?;
        match receiver.await {
            Ok(reply) => Ok(reply?),
            Err(_) => Err(InvocationFailure::NoReply),
        }
    }

    fn ensure_consumer(&self, target: &RegisteredTarget) -> Result<(), InvocationFailure> {
        let mut consumers = self.consumers.lock();
        if consumers
            .get(&target.id)
            .is_some_and(|consumer| !consumer.is_finished())
        {
            return Ok(());
        }

        self.queue.ensure_queue(&target.queue_name)?;
        let handler = Arc::new(QueuedInvocationHandler {
            worker: target.worker.clone(),
            pending: self.pending.clone(),
        });
        let consumer = QueueConsumer::new(self.queue.clone(), &target.queue_name, handler)
            .with_poll_interval(self.consumer_poll_interval)
            .with_concurrency(self.consumer_concurrency)
            .spawn();
        consumers.insert(target.id.clone(), consumer);

        debug!(target_id = %target.id, queue = %target.queue_name, "Queue consumer started for target");
        Ok(())
    }

    async fn invoke_event(
        &self,
        target: &RegisteredTarget,
        request: InvocationRequest,
    ) -> Result<Value, InvocationFailure> {
        let event = Event::new(
            events::invocation_event_type(&target.id),
            sources::INTEGRATION_MANAGER,
            json!({
                "payload": request.payload,
                "attempt": request.attempt,
                "timeoutMs": request.timeout.as_millis() as u64,
            }),
        )
        .with_correlation_id(request.correlation_id);

        let (sender, mut receiver) = oneshot::channel();
        self.pending.insert(event.id, sender);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: event.id,
        };

        let report = self.event_bus.publish(event).await?;
        if let Ok(reply) = receiver.try_recv() {
            return Ok(reply?);
        }

        match report.outcome_for(&target.subscriber_id) {
            None => Err(InvocationFailure::StrategyUnavailable {
                strategy: InvocationStrategy::Event,
                reason: format!("no subscriber bound to {}", target.id),
            }),
            Some(DeliveryOutcome::TimedOut { timeout_ms }) => Err(InvocationFailure::Timeout {
                timeout_ms: *timeout_ms,
            }),
            Some(_) => Err(InvocationFailure::NoReply),
        }
    }

    async fn publish_failed(
        &self,
        target: &RegisteredTarget,
        strategy: InvocationStrategy,
        correlation_id: &str,
        error: &IntegrationError,
        started: Instant,
    ) {
        self.publish_lifecycle(
            events::INTEGRATION_FAILED,
            correlation_id,
            json!({
                "targetId": target.id,
                "strategy": strategy,
                "attempts": error.attempts,
                "error": error.cause.to_string(),
                "errorKind": error.kind(),
                "durationMs": started.elapsed().as_millis() as u64,
            }),
        )
        .await;
    }

    async fn forward_circuit_transitions(&self) {
        let drained: Vec<CircuitStateTransition> = {
            let mut receiver = self.transitions.lock();
            let mut drained = Vec::new();
            loop {
                match receiver.try_recv() {
                    Ok(transition) => drained.push(transition),
                    Err(TryRecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Circuit transition notifications dropped");
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
            drained
        };

        for transition in drained {
            self.publish_lifecycle(
                events::INTEGRATION_CIRCUIT_STATE_CHANGED,
                &Uuid::new_v4().to_string(),
                json!({
                    "targetId": transition.component,
                    "from": transition.from,
                    "to": transition.to,
                    "at": transition.at,
                }),
            )
            .await;
        }
    }

    async fn publish_lifecycle(&self, event_type: &str, correlation_id: &str, data: Value) {
        let event = Event::new(event_type, sources::INTEGRATION_MANAGER, data)
            .with_correlation_id(correlation_id);
        if let Err(e) = self.event_bus.publish(event).await {
            error!(event_type = %event_type, error = %e, "Failed to publish lifecycle event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FnSubscriber;
    use crate::integration::FnWorker;
    use std::sync::atomic::AtomicUsize;

    fn manager() -> IntegrationManager {
        IntegrationManager::new(Arc::new(EventBus::new()), Arc::new(MessageQueue::new()))
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_delays(Duration::from_millis(1), Duration::from_millis(5))
            .with_jitter(false)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    /// Fails with a transient error the first `failures` times, then echoes the payload
    fn flaky_worker(failures: usize, calls: Arc<AtomicUsize>) -> Arc<dyn Worker> {
        FnWorker::new(move |request: InvocationRequest| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < failures {
                    Err(WorkerError::transient("connection reset"))
                } else {
                    Ok(json!({"echo": request.payload, "attempt": request.attempt}))
                }
            }
        })
    }

    #[tokio::test]
    async fn test_direct_invocation_retries_transient_failures() {
        let manager = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        manager
            .register_target(
                IntegrationTarget::new("echo", flaky_worker(2, calls.clone()))
                    .with_retry_policy(fast_retry(3)),
            )
            .unwrap();

        let result = manager
            .invoke("echo", json!("hi"), Duration::from_secs(1), "corr-1")
            .await
            .unwrap();

        assert_eq!(result["echo"], "hi");
        assert_eq!(result["attempt"], 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let manager = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let worker = FnWorker::new(move |_request: InvocationRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<Value, _>(WorkerError::permanent("bad request")) }
        });
        manager
            .register_target(IntegrationTarget::new("strict", worker).with_retry_policy(fast_retry(5)))
            .unwrap();

        let error = manager
            .invoke("strict", json!({}), Duration::from_secs(1), "corr")
            .await
            .unwrap_err();

        assert_eq!(error.target_id, "strict");
        assert_eq!(error.attempts, 1);
        assert_eq!(error.cause, InvocationFailure::Worker(WorkerError::permanent("bad request")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let error = manager()
            .invoke("missing", json!({}), Duration::from_secs(1), "corr")
            .await
            .unwrap_err();
        assert_eq!(error.cause, InvocationFailure::TargetNotFound);
        assert_eq!(error.attempts, 0);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let manager = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        manager
            .register_target(IntegrationTarget::new("dup", flaky_worker(0, calls.clone())))
            .unwrap();
        let error = manager
            .register_target(IntegrationTarget::new("dup", flaky_worker(0, calls)))
            .unwrap_err();
        assert_eq!(error.cause, InvocationFailure::TargetAlreadyRegistered);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient_failure() {
        let manager = manager();
        let worker = FnWorker::new(|_request: InvocationRequest| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!(null))
        });
        manager
            .register_target(IntegrationTarget::new("slow", worker).with_retry_policy(fast_retry(2)))
            .unwrap();

        let error = manager
            .invoke("slow", json!({}), Duration::from_millis(20), "corr")
            .await
            .unwrap_err();

        assert!(error.is_timeout());
        assert_eq!(error.attempts, 2);
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast_without_calling_worker() {
        let manager = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        manager
            .register_target(
                IntegrationTarget::new("fragile", flaky_worker(usize::MAX, calls.clone()))
                    .with_retry_policy(fast_retry(1))
                    .with_circuit_breaker(CircuitBreakerConfig {
                        failure_threshold: 2,
                        recovery_timeout: Duration::from_secs(60),
                        half_open_success_threshold: 1,
                    }),
            )
            .unwrap();

        for _ in 0..2 {
            let _ = manager
                .invoke("fragile", json!({}), Duration::from_secs(1), "corr")
                .await;
        }
        assert_eq!(
            manager.circuit_breaker("fragile").unwrap().state(),
            CircuitState::Open
        );

        let error = manager
            .invoke("fragile", json!({}), Duration::from_secs(1), "corr")
            .await
            .unwrap_err();
        assert!(error.is_circuit_open());
        assert_eq!(error.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stream_strategy_collects_chunks() {
        let manager = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        manager
            .register_target(IntegrationTarget::new("streamer", flaky_worker(0, calls)))
            .unwrap();

        let result = manager
            .invoke_with_strategy(
                "streamer",
                json!(7),
                Duration::from_secs(1),
                "corr",
                InvocationStrategy::Stream,
            )
            .await
            .unwrap();
        assert_eq!(result, json!([{"echo": 7, "attempt": 1}]));
    }

    #[tokio::test]
    async fn test_queued_strategy_round_trip() {
        let manager = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        manager
            .register_target(
                IntegrationTarget::new("reports", flaky_worker(1, calls.clone()))
                    .with_retry_policy(fast_retry(3))
                    .with_strategy(InvocationStrategy::Queued),
            )
            .unwrap();

        let result = manager
            .invoke("reports", json!("q"), Duration::from_secs(2), "corr-q")
            .await
            .unwrap();

        assert_eq!(result["echo"], "q");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let queue_name = IntegrationManager::queue_name_for("reports");
        // The consumer acknowledges after the reply is routed back
        wait_until(|| manager.queue().depth(&queue_name).unwrap() == 0).await;
        assert!(manager.queue().dead_letters(&queue_name).unwrap().is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_queued_final_failure_is_dead_lettered() {
        let manager = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        manager
            .register_target(
                IntegrationTarget::new("ledger", flaky_worker(usize::MAX, calls))
                    .with_retry_policy(fast_retry(2))
                    .with_strategy(InvocationStrategy::Queued),
            )
            .unwrap();

        let error = manager
            .invoke("ledger", json!({"entry": 1}), Duration::from_secs(2), "corr-l")
            .await
            .unwrap_err();
        assert_eq!(error.attempts, 2);

        let queue_name = IntegrationManager::queue_name_for("ledger");
        wait_until(|| manager.queue().dead_letters(&queue_name).unwrap().len() == 1).await;
        let dead = manager.queue().dead_letters(&queue_name).unwrap();
        assert_eq!(manager.queue().depth(&queue_name).unwrap(), 0);
        assert_eq!(dead[0].message.correlation_id, "corr-l");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_queued_invocations_do_not_wait_on_each_other() {
        let manager = Arc::new(manager());
        let worker = FnWorker::new(|request: InvocationRequest| async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            Ok(request.payload)
        });
        manager
            .register_target(
                IntegrationTarget::new("batch", worker)
                    .with_retry_policy(fast_retry(1))
                    .with_strategy(InvocationStrategy::Queued),
            )
            .unwrap();

        let mut tasks = Vec::new();
        for i in 0..3 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .invoke("batch", json!(i), Duration::from_millis(150), "corr-b")
                    .await
            }));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap().unwrap(), json!(i));
        }
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_event_delivery_outliving_invocation_timeout_is_dead_lettered() {
        let manager = manager();
        let worker = FnWorker::new(|_request: InvocationRequest| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err::<Value, _>(WorkerError::transient("downstream unavailable"))
        });
        manager
            .register_target(
                IntegrationTarget::new("webhook", worker)
                    .with_retry_policy(fast_retry(1))
                    .with_strategy(InvocationStrategy::Event),
            )
            .unwrap();

        let error = manager
            .invoke("webhook", json!({}), Duration::from_millis(30), "corr-w")
            .await
            .unwrap_err();
        assert!(error.is_timeout());

        // The delivery keeps running after the caller gave up and still lands in the store
        let subscriber_id = IntegrationManager::subscriber_id_for("webhook");
        wait_until(|| manager.event_bus().dead_letters(&subscriber_id).len() == 1).await;
        let dead = manager.event_bus().dead_letters(&subscriber_id);
        assert_eq!(dead[0].event.correlation_id, "corr-w");
        assert!(dead[0].error.contains("downstream unavailable"));
    }

    #[tokio::test]
    async fn test_event_strategy_dead_letters_failed_delivery() {
        let manager = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        manager
            .register_target(
                IntegrationTarget::new("notifier", flaky_worker(1, calls.clone()))
                    .with_retry_policy(fast_retry(2))
                    .with_strategy(InvocationStrategy::Event),
            )
            .unwrap();

        let result = manager
            .invoke("notifier", json!("e"), Duration::from_secs(1), "corr-e")
            .await
            .unwrap();
        assert_eq!(result["echo"], "e");

        let dead = manager
            .event_bus()
            .dead_letters(&IntegrationManager::subscriber_id_for("notifier"));
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].event.correlation_id, "corr-e");
    }

    #[tokio::test]
    async fn test_lifecycle_events_published() {
        let manager = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager
            .event_bus()
            .subscribe(
                "integration.*",
                FnSubscriber::new("observer", move |event: Event| {
                    sink.lock().push(event.event_type);
                    async { Ok(()) }
                }),
            )
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        manager
            .register_target(IntegrationTarget::new("svc", flaky_worker(0, calls)))
            .unwrap();
        manager
            .invoke("svc", json!({}), Duration::from_secs(1), "corr")
            .await
            .unwrap();

        assert_eq!(
            *seen.lock(),
            vec![events::INTEGRATION_INVOKED, events::INTEGRATION_COMPLETED]
        );
    }

    #[tokio::test]
    async fn test_bulkhead_limits_concurrent_calls() {
        let manager = Arc::new(manager());
        manager.bulkheads().register("db", 1);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());
        let worker = FnWorker::new(move |_request: InvocationRequest| {
            let (active, peak) = (a.clone(), p.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        });
        manager
            .register_target(IntegrationTarget::new("db-writer", worker).with_resource_class("db"))
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .invoke("db-writer", json!({}), Duration::from_secs(1), "corr")
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
