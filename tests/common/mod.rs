//! Shared helpers for crate-level integration tests.

#![allow(dead_code)]

pub mod strategies;

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tasker_flow::events::EventBus;
use tasker_flow::integration::{FnWorker, IntegrationManager, InvocationRequest, Worker, WorkerError};
use tasker_flow::messaging::MessageQueue;
use tasker_flow::resilience::RetryPolicy;

/// Install a test subscriber once; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tasker_flow=debug")
        .with_test_writer()
        .try_init();
}

/// Millisecond-scale backoff without jitter
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(max_attempts)
        .with_delays(Duration::from_millis(1), Duration::from_millis(5))
        .with_jitter(false)
}

pub fn integration_manager() -> Arc<IntegrationManager> {
    Arc::new(IntegrationManager::new(
        Arc::new(EventBus::new()),
        Arc::new(MessageQueue::new()),
    ))
}

/// Returns `{"worker": <name>, "payload": <payload>}`
pub fn echo_worker(name: &'static str) -> Arc<dyn Worker> {
    FnWorker::new(move |request: InvocationRequest| async move {
        Ok(json!({"worker": name, "payload": request.payload}))
    })
}

pub fn failing_worker(error: WorkerError) -> Arc<dyn Worker> {
    FnWorker::new(move |_request: InvocationRequest| {
        let error = error.clone();
        async move { Err::<Value, _>(error) }
    })
}

/// Fails transiently `failures` times, then succeeds; counts every call
pub fn flaky_worker(failures: u32, calls: Arc<AtomicU32>) -> Arc<dyn Worker> {
    FnWorker::new(move |_request: InvocationRequest| {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if call <= failures {
                Err(WorkerError::transient(format!("attempt {call} failed")))
            } else {
                Ok(json!({"call": call}))
            }
        }
    })
}

/// Poll `condition` every few milliseconds for up to two seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
