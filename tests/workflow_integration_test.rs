//! End-to-end workflow execution over the integration layer.

mod common;

use common::{echo_worker, failing_worker, init_tracing, integration_manager};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tasker_flow::config::WorkflowSettings;
use tasker_flow::constants::events;
use tasker_flow::integration::{
    FnWorker, IntegrationManager, IntegrationTarget, InvocationRequest, InvocationStrategy, WorkerError,
};
use tasker_flow::orchestration::{
    ErrorStrategy, WorkflowDefinition, WorkflowError, WorkflowOrchestrator, WorkflowStep,
};
use tasker_flow::resilience::RetryPolicy;
use tasker_flow::state_machine::{StepStatus, WorkflowStatus};

fn register(manager: &IntegrationManager, id: &str, worker: Arc<dyn tasker_flow::Worker>) {
    manager
        .register_target(IntegrationTarget::new(id, worker).with_retry_policy(RetryPolicy::no_retry()))
        .unwrap();
}

/// A -> {B, C} -> D, with B bound to `b_target`
fn diamond(strategy: ErrorStrategy, b_target: &str) -> WorkflowDefinition {
    WorkflowDefinition::new("diamond", strategy)
        .with_step(WorkflowStep::new("A", "echo"))
        .with_step(WorkflowStep::new("B", b_target).depends_on(["A"]))
        .with_step(WorkflowStep::new("C", "echo").depends_on(["A"]))
        .with_step(WorkflowStep::new("D", "echo").depends_on(["B", "C"]))
}

fn manager_with_defaults() -> Arc<IntegrationManager> {
    let manager = integration_manager();
    register(&manager, "echo", echo_worker("echo"));
    register(&manager, "broken", failing_worker(WorkerError::permanent("card declined")));
    manager
}

#[tokio::test]
async fn test_diamond_succeeds_and_passes_outputs_downstream() {
    init_tracing();
    let orchestrator = WorkflowOrchestrator::new(manager_with_defaults());

    let instance = orchestrator
        .execute(diamond(ErrorStrategy::Rollback, "echo"), json!({"orderId": 42}))
        .await
        .unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert!(instance.all_steps_terminal());
    assert!(instance.is_terminal());
    let d_output = instance.step("D").unwrap().output.clone().unwrap();
    let dependencies = &d_output["payload"]["dependencies"];
    assert_eq!(dependencies["B"]["worker"], json!("echo"));
    assert_eq!(dependencies["C"]["payload"]["input"], json!({"orderId": 42}));
}

#[tokio::test]
async fn test_continue_completes_with_errors_and_runs_dependents() {
    let orchestrator = WorkflowOrchestrator::new(manager_with_defaults());

    let instance = orchestrator
        .execute(diamond(ErrorStrategy::Continue, "broken"), json!({}))
        .await
        .unwrap();

    assert_eq!(instance.status, WorkflowStatus::CompletedWithErrors);
    assert_eq!(instance.step_status("A"), Some(StepStatus::Succeeded));
    assert_eq!(instance.step_status("B"), Some(StepStatus::Failed));
    assert_eq!(instance.step_status("C"), Some(StepStatus::Succeeded));
    assert_eq!(instance.step_status("D"), Some(StepStatus::Succeeded));

    let failed = instance.step("B").unwrap();
    assert!(failed.error.as_deref().unwrap_or_default().contains("card declined"));
    assert_eq!(failed.attempts, 1);
    let d_output = instance.step("D").unwrap().output.clone().unwrap();
    assert_eq!(d_output["payload"]["dependencies"]["B"], Value::Null);
}

#[tokio::test]
async fn test_rollback_skips_dependents_and_fails_instance() {
    let orchestrator = WorkflowOrchestrator::new(manager_with_defaults());

    let instance = orchestrator
        .execute(diamond(ErrorStrategy::Rollback, "broken"), json!({}))
        .await
        .unwrap();

    assert_eq!(instance.status, WorkflowStatus::Failed);
    assert!(!instance.cancelled);
    assert_eq!(instance.step_status("B"), Some(StepStatus::Failed));
    assert_eq!(instance.step_status("C"), Some(StepStatus::Succeeded));
    assert_eq!(instance.step_status("D"), Some(StepStatus::Skipped));
    assert!(instance.step("D").unwrap().started_at.is_none());
}

#[tokio::test]
async fn test_cycle_rejected_before_any_step_runs() {
    let manager = integration_manager();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    register(
        &manager,
        "echo",
        FnWorker::new(move |request: InvocationRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(request.payload) }
        }),
    );

    let definition = WorkflowDefinition::new("loop", ErrorStrategy::Continue)
        .with_step(WorkflowStep::new("root", "echo"))
        .with_step(WorkflowStep::new("x", "echo").depends_on(["root", "z"]))
        .with_step(WorkflowStep::new("y", "echo").depends_on(["x"]))
        .with_step(WorkflowStep::new("z", "echo").depends_on(["y"]));

    let orchestrator = WorkflowOrchestrator::new(manager);
    let error = orchestrator.submit(definition, json!({})).unwrap_err();
    match error {
        WorkflowError::CyclicWorkflow { steps, .. } => assert_eq!(steps, vec!["x", "y", "z"]),
        other => panic!("expected a cycle, got {other}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(orchestrator.instance_ids().is_empty());
}

fn sleeper(delay: Duration) -> Arc<dyn tasker_flow::Worker> {
    FnWorker::new(move |_request: InvocationRequest| async move {
        tokio::time::sleep(delay).await;
        Ok(Value::Null)
    })
}

#[tokio::test]
async fn test_levels_are_barriers() {
    let manager = integration_manager();
    register(&manager, "quick", sleeper(Duration::from_millis(5)));
    register(&manager, "lengthy", sleeper(Duration::from_millis(60)));

    let definition = WorkflowDefinition::new("barrier", ErrorStrategy::Continue)
        .with_step(WorkflowStep::new("fast", "quick"))
        .with_step(WorkflowStep::new("slow", "lengthy").with_timeout(Duration::from_secs(1)))
        .with_step(WorkflowStep::new("after_fast", "quick").depends_on(["fast"]));

    let instance = WorkflowOrchestrator::new(manager)
        .execute(definition, json!({}))
        .await
        .unwrap();
    assert_eq!(instance.status, WorkflowStatus::Completed);

    // after_fast only depends on fast, yet it waits for the whole first level
    let slow_done = instance.step("slow").unwrap().completed_at.unwrap();
    let after_started = instance.step("after_fast").unwrap().started_at.unwrap();
    assert!(after_started >= slow_done);
}

#[tokio::test]
async fn test_lifecycle_events_published_in_order() {
    let manager = manager_with_defaults();
    let mut observed = manager.event_bus().observe();
    let orchestrator = WorkflowOrchestrator::new(manager);

    let instance = orchestrator
        .execute(diamond(ErrorStrategy::Continue, "broken"), json!({}))
        .await
        .unwrap();

    let mut workflow_events = Vec::new();
    while let Ok(event) = observed.try_recv() {
        if event.event_type.starts_with("workflow.") {
            assert_eq!(event.correlation_id, instance.id.to_string());
            workflow_events.push(event.event_type);
        }
    }

    assert_eq!(workflow_events.first().map(String::as_str), Some(events::WORKFLOW_STARTED));
    assert_eq!(
        workflow_events.last().map(String::as_str),
        Some(events::WORKFLOW_COMPLETED_WITH_ERRORS)
    );
    let count = |kind: &str| workflow_events.iter().filter(|e| *e == kind).count();
    assert_eq!(count(events::STEP_STARTED), 4);
    assert_eq!(count(events::STEP_SUCCEEDED), 3);
    assert_eq!(count(events::STEP_FAILED), 1);
}

#[tokio::test]
async fn test_cancel_running_workflow() {
    let manager = manager_with_defaults();
    register(
        &manager,
        "stuck",
        FnWorker::new(|_request: InvocationRequest| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Value::Null)
        }),
    );
    let definition = WorkflowDefinition::new("stuck", ErrorStrategy::Rollback)
        .with_step(WorkflowStep::new("A", "echo"))
        .with_step(WorkflowStep::new("B", "stuck").depends_on(["A"]))
        .with_step(WorkflowStep::new("C", "echo").depends_on(["B"]));

    let orchestrator = WorkflowOrchestrator::new(manager);
    let id = orchestrator.submit(definition, json!({})).unwrap();

    let started = Instant::now();
    while orchestrator.instance(id).and_then(|i| i.step_status("B")) != Some(StepStatus::Running) {
        assert!(started.elapsed() < Duration::from_secs(2), "step B never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    orchestrator.cancel(id).unwrap();

    let instance = orchestrator.wait(id).await.unwrap();
    assert_eq!(instance.status, WorkflowStatus::Failed);
    assert!(instance.cancelled);
    assert_eq!(instance.step_status("A"), Some(StepStatus::Succeeded));
    assert_eq!(instance.step_status("B"), Some(StepStatus::Skipped));
    assert_eq!(instance.step_status("C"), Some(StepStatus::Skipped));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_queued_and_event_steps_in_one_workflow() {
    let manager = integration_manager();
    manager
        .register_target(
            IntegrationTarget::new("mailer", echo_worker("mailer")).with_strategy(InvocationStrategy::Queued),
        )
        .unwrap();
    manager
        .register_target(
            IntegrationTarget::new("ledger", echo_worker("ledger")).with_strategy(InvocationStrategy::Event),
        )
        .unwrap();
    register(&manager, "echo", echo_worker("echo"));

    let definition = WorkflowDefinition::new("mixed", ErrorStrategy::Rollback)
        .with_step(WorkflowStep::new("record", "ledger"))
        .with_step(WorkflowStep::new("notify", "mailer").depends_on(["record"]))
        .with_step(WorkflowStep::new("close", "echo").depends_on(["notify"]));

    let orchestrator = WorkflowOrchestrator::new(manager.clone());
    let instance = orchestrator.execute(definition, json!({"id": 1})).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    let notify = instance.step("notify").unwrap().output.clone().unwrap();
    assert_eq!(notify["worker"], json!("mailer"));
    assert_eq!(notify["payload"]["dependencies"]["record"]["worker"], json!("ledger"));
    manager.shutdown().await;
}

#[tokio::test]
async fn test_global_step_limit_from_settings() {
    let manager = integration_manager();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (active.clone(), peak.clone());
    register(
        &manager,
        "busy",
        FnWorker::new(move |_request: InvocationRequest| {
            let (active, peak) = (a.clone(), p.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(15)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        }),
    );

    let settings = WorkflowSettings {
        max_concurrent_steps: 2,
        ..WorkflowSettings::default()
    };
    let orchestrator = WorkflowOrchestrator::from_config(&settings, manager);

    let mut definition = WorkflowDefinition::new("wide", ErrorStrategy::Continue);
    for i in 0..6 {
        definition = definition.with_step(WorkflowStep::new(format!("s{i}"), "busy"));
    }
    let instance = orchestrator.execute(definition, json!({})).await.unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}
