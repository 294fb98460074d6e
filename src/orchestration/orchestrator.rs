//! # Workflow Orchestrator
//!
//! Executes workflow DAGs level by level through the [`IntegrationManager`].
//!
//! ## Execution model
//!
//! - Definitions are validated at submission; cyclic graphs are rejected.
//! - Each level is a strict barrier: every step of level `n` is terminal before
//!   any step of level `n + 1` leaves PENDING.
//! - Within a level, parallelizable steps run concurrently as tokio tasks; the
//!   remaining steps then run one at a time. A global [`ResourcePool`] caps the
//!   number of steps running across all instances of one orchestrator.
//! - A step receives `{"input": <workflow input>, "dependencies": {<id>: <output or null>}}`.
//!
//! ## Failure policy
//!
//! - **ROLLBACK**: a failed step skips every not-yet-started transitive
//!   dependent; independent branches still run. The instance ends FAILED and
//!   compensation targets of succeeded steps run in reverse completion order.
//! - **CONTINUE**: dependents still run with a null input for the failed step
//!   unless they list it in `required_inputs`. The instance ends
//!   COMPLETED_WITH_ERRORS when any step failed.
//!
//! Cancelling an instance skips every step that has not finished and ends the
//! instance FAILED with `cancelled = true`.

use super::errors::{WorkflowError, WorkflowResult};
use super::graph::DependencyGraph;
use super::types::{ErrorStrategy, StepResult, WorkflowDefinition, WorkflowInstance, WorkflowStep};
use crate::config::WorkflowSettings;
use crate::constants::{events, sources};
use crate::events::{Event, EventBus};
use crate::integration::IntegrationManager;
use crate::resilience::ResourcePool;
use crate::state_machine::{StepStatus, WorkflowStatus};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Live state of one instance
struct InstanceSlot {
    instance: Mutex<WorkflowInstance>,
    /// Completion order of succeeded steps, for compensation
    completed: Mutex<Vec<String>>,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
}

impl InstanceSlot {
    fn new(instance: WorkflowInstance) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            instance: Mutex::new(instance),
            completed: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            done,
        }
    }

    fn snapshot(&self) -> WorkflowInstance {
        self.instance.lock().clone()
    }

    fn instance_id(&self) -> Uuid {
        self.instance.lock().id
    }

    fn step_status(&self, step_id: &str) -> StepStatus {
        self.instance
            .lock()
            .step_status(step_id)
            .unwrap_or_default()
    }

    /// Apply a legal transition; returns `false` (and changes nothing) otherwise
    fn transition(&self, step_id: &str, to: StepStatus, update: impl FnOnce(&mut StepResult)) -> bool {
        let mut instance = self.instance.lock();
        let Some(result) = instance.step_results.get_mut(step_id) else {
            return false;
        };
        if !result.status.can_transition_to(to) {
            debug!(step_id = %step_id, from = %result.status, to = %to, "Ignoring illegal step transition");
            return false;
        }
        result.status = to;
        update(result);
        true
    }
}

struct OrchestratorInner {
    integration: Arc<IntegrationManager>,
    event_bus: Arc<EventBus>,
    step_slots: ResourcePool,
    default_step_timeout: Duration,
    instances: DashMap<Uuid, Arc<InstanceSlot>>,
}

/// Runs workflow instances; cheap to clone, clones share instances
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl std::fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("instances", &self.inner.instances.len())
            .field("step_slots", &self.inner.step_slots)
            .field("default_step_timeout", &self.inner.default_step_timeout)
            .finish()
    }
}

impl WorkflowOrchestrator {
    pub fn new(integration: Arc<IntegrationManager>) -> Self {
        Self::from_config(&WorkflowSettings::default(), integration)
    }

    pub fn from_config(settings: &WorkflowSettings, integration: Arc<IntegrationManager>) -> Self {
        info!(
            max_concurrent_steps = settings.max_concurrent_steps,
            default_step_timeout_ms = settings.default_step_timeout_ms,
            "🚀 Workflow orchestrator initialized"
        );
        Self {
            inner: Arc::new(OrchestratorInner {
                event_bus: integration.event_bus().clone(),
                integration,
                step_slots: ResourcePool::new("workflow_steps", settings.max_concurrent_steps.max(1)),
                default_step_timeout: settings.default_step_timeout(),
                instances: DashMap::new(),
            }),
        }
    }

    /// Check a definition without running it
    pub fn validate(&self, definition: &WorkflowDefinition) -> WorkflowResult<DependencyGraph> {
        let graph = DependencyGraph::build(definition)?;
        for step in &definition.steps {
            let targets = std::iter::once(&step.target_worker_id).chain(&step.compensation_target);
            for target in targets {
                if !self.inner.integration.has_target(target) {
                    return Err(WorkflowError::UnknownTarget {
                        workflow_id: definition.id.clone(),
                        step_id: step.id.clone(),
                        target_id: target.clone(),
                    });
                }
            }
        }
        Ok(graph)
    }

    /// Start an instance in the background and return its id
    pub fn submit(&self, definition: WorkflowDefinition, input: Value) -> WorkflowResult<Uuid> {
        let (slot, graph) = self.prepare(&definition)?;
        let instance_id = slot.instance_id();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run(slot, Arc::new(definition), graph, input).await;
        });
        Ok(instance_id)
    }

    /// Run an instance to completion in the caller's task and hand back its result
    pub async fn execute(&self, definition: WorkflowDefinition, input: Value) -> WorkflowResult<WorkflowInstance> {
        let (slot, graph) = self.prepare(&definition)?;
        let instance_id = slot.instance_id();
        self.inner
            .clone()
            .run(slot, Arc::new(definition), graph, input)
            .await;
        self.take_result(instance_id)
    }

    /// Wait for an instance to finish; the result stays retained
    pub async fn wait(&self, instance_id: Uuid) -> WorkflowResult<WorkflowInstance> {
        let slot = self.slot(instance_id)?;
        let mut done = slot.done.subscribe();
        done.wait_for(|finished| *finished)
            .await
            .map_err(|e| WorkflowError::ExecutionAborted {
                instance_id,
                reason: e.to_string(),
            })?;
        Ok(slot.snapshot())
    }

    /// Current snapshot of an instance
    pub fn instance(&self, instance_id: Uuid) -> Option<WorkflowInstance> {
        self.inner
            .instances
            .get(&instance_id)
            .map(|slot| slot.snapshot())
    }

    /// Remove a finished instance and return its final state
    pub fn take_result(&self, instance_id: Uuid) -> WorkflowResult<WorkflowInstance> {
        let slot = self.slot(instance_id)?;
        if !*slot.done.borrow() {
            return Err(WorkflowError::InstanceNotFinished { instance_id });
        }
        self.inner.instances.remove(&instance_id);
        Ok(slot.snapshot())
    }

    /// Signal cancellation; running and pending steps end SKIPPED
    pub fn cancel(&self, instance_id: Uuid) -> WorkflowResult<()> {
        let slot = self.slot(instance_id)?;
        if !*slot.done.borrow() {
            info!(instance_id = %instance_id, "🛑 Cancelling workflow instance");
            slot.cancel.cancel();
        }
        Ok(())
    }

    /// Ids of retained instances, finished or not
    pub fn instance_ids(&self) -> Vec<Uuid> {
        self.inner.instances.iter().map(|e| *e.key()).collect()
    }

    pub fn running_count(&self) -> usize {
        self.inner
            .instances
            .iter()
            .filter(|e| !*e.value().done.borrow())
            .count()
    }

    fn slot(&self, instance_id: Uuid) -> WorkflowResult<Arc<InstanceSlot>> {
        self.inner
            .instances
            .get(&instance_id)
            .map(|slot| slot.clone())
            .ok_or_else(|| WorkflowError::instance_not_found(instance_id))
    }

    fn prepare(&self, definition: &WorkflowDefinition) -> WorkflowResult<(Arc<InstanceSlot>, DependencyGraph)> {
        let graph = self.validate(definition)?;
        let slot = Arc::new(InstanceSlot::new(WorkflowInstance::new(definition)));
        self.inner.instances.insert(slot.instance_id(), slot.clone());
        Ok((slot, graph))
    }
}

impl OrchestratorInner {
    #[instrument(skip_all, fields(workflow_id = %definition.id, instance_id = %slot.instance_id()))]
    async fn run(
        self: Arc<Self>,
        slot: Arc<InstanceSlot>,
        definition: Arc<WorkflowDefinition>,
        graph: DependencyGraph,
        input: Value,
    ) {
        let instance_id = slot.instance_id();
        let graph = Arc::new(graph);
        let input = Arc::new(input);
        let started = Instant::now();

        info!(
            levels = graph.level_count(),
            steps = graph.step_count(),
            error_strategy = %definition.error_strategy,
            "▶️ Workflow instance started"
        );
        self.publish(
            events::WORKFLOW_STARTED,
            instance_id,
            json!({
                "workflowId": definition.id,
                "instanceId": instance_id,
                "errorStrategy": definition.error_strategy,
            }),
        )
        .await;

        for (level_index, level) in graph.levels().iter().enumerate() {
            if slot.cancel.is_cancelled() {
                break;
            }

            let mut parallel = Vec::new();
            let mut sequential = Vec::new();
            for step_id in level {
                let Some(step) = definition.step(step_id) else {
                    continue;
                };
                if slot.step_status(step_id) != StepStatus::Pending {
                    continue;
                }
                if let Some(missing) = self.unavailable_required_input(&slot, &definition, step) {
                    self.skip_step(&slot, step_id, format!("required input {missing} unavailable"))
                        .await;
                    continue;
                }
                if step.parallelizable {
                    parallel.push(step.clone());
                } else {
                    sequential.push(step.clone());
                }
            }

            debug!(
                level = level_index,
                parallel = parallel.len(),
                sequential = sequential.len(),
                "Running workflow level"
            );

            let mut tasks = JoinSet::new();
            for step in parallel {
                tasks.spawn(self.clone().run_step(
                    slot.clone(),
                    definition.clone(),
                    graph.clone(),
                    input.clone(),
                    step,
                ));
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(join_error) = joined {
                    error!(error = %join_error, "Workflow step task panicked");
                }
            }

            for step in sequential {
                if slot.step_status(&step.id) != StepStatus::Pending {
                    continue;
                }
                let outcome = tokio::spawn(self.clone().run_step(
                    slot.clone(),
                    definition.clone(),
                    graph.clone(),
                    input.clone(),
                    step,
                ))
                .await;
                if let Err(join_error) = outcome {
                    error!(error = %join_error, "Workflow step task panicked");
                }
            }

            // A step whose task died is failed so the barrier still holds
            for step_id in level {
                if slot.step_status(step_id) == StepStatus::Running {
                    self.fail_step(&slot, &definition, &graph, step_id, "step task aborted".to_string(), 0)
                        .await;
                }
            }
        }

        let cancelled = slot.cancel.is_cancelled();
        if cancelled {
            let pending = slot.instance.lock().steps_with_status(StepStatus::Pending).into_iter().map(str::to_string).collect::<Vec<_>>();
            for step_id in pending {
                self.skip_step(&slot, &step_id, "workflow cancelled".to_string()).await;
            }
        }

        let status = {
            let instance = slot.instance.lock();
            let any_failed = instance
                .step_results
                .values()
                .any(|r| r.status == StepStatus::Failed);
            match (cancelled, any_failed, definition.error_strategy) {
                (true, _, _) => WorkflowStatus::Failed,
                (false, false, _) => WorkflowStatus::Completed,
                (false, true, ErrorStrategy::Rollback) => WorkflowStatus::Failed,
                (false, true, ErrorStrategy::Continue) => WorkflowStatus::CompletedWithErrors,
            }
        };

        if status == WorkflowStatus::Failed && definition.error_strategy == ErrorStrategy::Rollback {
            self.compensate(&slot, &definition, &input).await;
        }

        let snapshot = {
            let mut instance = slot.instance.lock();
            if instance.status.can_transition_to(status) {
                instance.status = status;
            }
            instance.cancelled = cancelled;
            instance.end_time = Some(Utc::now());
            instance.clone()
        };

        let event_type = match (status, cancelled) {
            (_, true) => events::WORKFLOW_CANCELLED,
            (WorkflowStatus::Completed, _) => events::WORKFLOW_COMPLETED,
            (WorkflowStatus::CompletedWithErrors, _) => events::WORKFLOW_COMPLETED_WITH_ERRORS,
            _ => events::WORKFLOW_FAILED,
        };
        let failed_steps = snapshot.steps_with_status(StepStatus::Failed);
        let skipped_steps = snapshot.steps_with_status(StepStatus::Skipped);

        match status {
            WorkflowStatus::Completed => info!(
                duration_ms = started.elapsed().as_millis() as u64,
                "✅ Workflow instance completed"
            ),
            _ => warn!(
                status = %status,
                cancelled = cancelled,
                failed_steps = ?failed_steps,
                skipped_steps = ?skipped_steps,
                duration_ms = started.elapsed().as_millis() as u64,
                "⚠️ Workflow instance finished with failures"
            ),
        }

        self.publish(
            event_type,
            instance_id,
            json!({
                "workflowId": definition.id,
                "instanceId": instance_id,
                "status": status,
                "cancelled": cancelled,
                "failedSteps": failed_steps,
                "skippedSteps": skipped_steps,
                "compensatedSteps": snapshot.compensated_steps,
                "durationMs": started.elapsed().as_millis() as u64,
            }),
        )
        .await;

        slot.done.send_replace(true);
    }

    async fn run_step(
        self: Arc<Self>,
        slot: Arc<InstanceSlot>,
        definition: Arc<WorkflowDefinition>,
        graph: Arc<DependencyGraph>,
        input: Arc<Value>,
        step: WorkflowStep,
    ) {
        let instance_id = slot.instance_id();

        let permit = tokio::select! {
            _ = slot.cancel.cancelled() => {
                self.skip_step(&slot, &step.id, "workflow cancelled".to_string()).await;
                return;
            }
            permit = self.step_slots.acquire(Duration::MAX) => permit,
        };
        let _permit = match permit {
            Ok(permit) => permit,
            Err(e) => {
                self.fail_step(&slot, &definition, &graph, &step.id, e.to_string(), 0)
                    .await;
                return;
            }
        };

        let started_at = Utc::now();
        if !slot.transition(&step.id, StepStatus::Running, |r| r.started_at = Some(started_at)) {
            return;
        }
        debug!(step_id = %step.id, target = %step.target_worker_id, "Step started");
        self.publish(
            events::STEP_STARTED,
            instance_id,
            json!({
                "workflowId": definition.id,
                "instanceId": instance_id,
                "stepId": step.id,
                "targetWorkerId": step.target_worker_id,
            }),
        )
        .await;

        let payload = json!({
            "input": input.as_ref(),
            "dependencies": self.dependency_outputs(&slot, &step),
        });
        let timeout = step.timeout.unwrap_or(self.default_step_timeout);
        let correlation_id = instance_id.to_string();
        let started = Instant::now();

        let outcome = tokio::select! {
            _ = slot.cancel.cancelled() => None,
            result = self.integration.invoke(&step.target_worker_id, payload, timeout, &correlation_id) => Some(result),
        };

        match outcome {
            None => {
                self.skip_step(&slot, &step.id, "workflow cancelled".to_string()).await;
            }
            Some(Ok(output)) => {
                let duration = started.elapsed();
                let recorded = slot.transition(&step.id, StepStatus::Succeeded, |r| {
                    r.output = Some(output);
                    r.duration = duration;
                    r.completed_at = Some(Utc::now());
                });
                if recorded {
                    slot.completed.lock().push(step.id.clone());
                    debug!(step_id = %step.id, duration_ms = duration.as_millis() as u64, "Step succeeded");
                    self.publish(
                        events::STEP_SUCCEEDED,
                        instance_id,
                        json!({
                            "workflowId": definition.id,
                            "instanceId": instance_id,
                            "stepId": step.id,
                            "durationMs": duration.as_millis() as u64,
                        }),
                    )
                    .await;
                }
            }
            Some(Err(e)) => {
                let attempts = e.attempts;
                self.fail_step(&slot, &definition, &graph, &step.id, e.to_string(), attempts)
                    .await;
            }
        }
    }

    /// `{step_id: output | null}` for every dependency of `step`
    fn dependency_outputs(&self, slot: &InstanceSlot, step: &WorkflowStep) -> Value {
        let instance = slot.instance.lock();
        let outputs: Map<String, Value> = step
            .depends_on
            .iter()
            .map(|dependency| {
                let output = instance
                    .step(dependency)
                    .filter(|r| r.status.satisfies_dependencies())
                    .and_then(|r| r.output.clone())
                    .unwrap_or(Value::Null);
                (dependency.clone(), output)
            })
            .collect();
        Value::Object(outputs)
    }

    /// First dependency that must have succeeded for `step` to run but didn't
    fn unavailable_required_input(
        &self,
        slot: &InstanceSlot,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
    ) -> Option<String> {
        let instance = slot.instance.lock();
        let required = match definition.error_strategy {
            ErrorStrategy::Rollback => &step.depends_on,
            ErrorStrategy::Continue => &step.required_inputs,
        };
        required
            .iter()
            .find(|dependency| {
                !instance
                    .step_status(dependency)
                    .is_some_and(|s| s.satisfies_dependencies())
            })
            .cloned()
    }

    async fn fail_step(
        &self,
        slot: &InstanceSlot,
        definition: &WorkflowDefinition,
        graph: &DependencyGraph,
        step_id: &str,
        error: String,
        attempts: u32,
    ) {
        let instance_id = slot.instance_id();
        let recorded = slot.transition(step_id, StepStatus::Failed, |r| {
            r.error = Some(error.clone());
            r.attempts = attempts;
            r.completed_at = Some(Utc::now());
            if let Some(started_at) = r.started_at {
                r.duration = (Utc::now() - started_at).to_std().unwrap_or_default();
            }
        });
        if !recorded {
            return;
        }

        warn!(step_id = %step_id, attempts = attempts, error = %error, "❌ Step failed");
        self.publish(
            events::STEP_FAILED,
            instance_id,
            json!({
                "workflowId": definition.id,
                "instanceId": instance_id,
                "stepId": step_id,
                "error": error,
                "attempts": attempts,
            }),
        )
        .await;

        if definition.error_strategy == ErrorStrategy::Rollback {
            for dependent in graph.transitive_dependents(step_id) {
                self.skip_step(slot, &dependent, format!("dependency {step_id} failed"))
                    .await;
            }
        }
    }

    async fn skip_step(&self, slot: &InstanceSlot, step_id: &str, reason: String) {
        let instance_id = slot.instance_id();
        let recorded = slot.transition(step_id, StepStatus::Skipped, |r| {
            r.error = Some(reason.clone());
            r.completed_at = Some(Utc::now());
        });
        if !recorded {
            return;
        }

        debug!(step_id = %step_id, reason = %reason, "Step skipped");
        self.publish(
            events::STEP_SKIPPED,
            instance_id,
            json!({
                "instanceId": instance_id,
                "stepId": step_id,
                "reason": reason,
            }),
        )
        .await;
    }

    /// Undo succeeded steps, most recently completed first
    async fn compensate(&self, slot: &InstanceSlot, definition: &WorkflowDefinition, input: &Value) {
        let instance_id = slot.instance_id();
        let completed: Vec<String> = slot.completed.lock().iter().rev().cloned().collect();

        for step_id in completed {
            let Some(step) = definition.step(&step_id) else {
                continue;
            };
            let Some(target) = &step.compensation_target else {
                continue;
            };

            let output = slot
                .instance
                .lock()
                .step(&step_id)
                .and_then(|r| r.output.clone())
                .unwrap_or(Value::Null);
            let payload = json!({
                "stepId": step_id,
                "input": input,
                "output": output,
            });
            let timeout = step.timeout.unwrap_or(self.default_step_timeout);

            let result = self
                .integration
                .invoke(target, payload, timeout, &instance_id.to_string())
                .await;
            let compensated = result.is_ok();
            match &result {
                Ok(_) => {
                    info!(step_id = %step_id, target = %target, "↩️ Step compensated");
                    slot.instance.lock().compensated_steps.push(step_id.clone());
                }
                Err(e) => error!(step_id = %step_id, target = %target, error = %e, "Compensation failed"),
            }

            self.publish(
                events::STEP_COMPENSATED,
                instance_id,
                json!({
                    "workflowId": definition.id,
                    "instanceId": instance_id,
                    "stepId": step_id,
                    "compensationTarget": target,
                    "succeeded": compensated,
                    "error": result.err().map(|e| e.to_string()),
                }),
            )
            .await;
        }
    }

    async fn publish(&self, event_type: &str, instance_id: Uuid, data: Value) {
        let event = Event::new(event_type, sources::WORKFLOW_ORCHESTRATOR, data)
            .with_correlation_id(instance_id.to_string());
        if let Err(e) = self.event_bus.publish(event).await {
            error!(event_type = %event_type, error = %e, "Failed to publish workflow event");
        }
    }
}
