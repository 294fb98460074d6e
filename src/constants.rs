//! # System Constants
//!
//! Lifecycle event names and default operating values shared across components.

use std::time::Duration;

/// Lifecycle events published on the event bus for observability
pub mod events {
    // Integration lifecycle events
    pub const INTEGRATION_INVOKED: &str = "integration.invoked";
    pub const INTEGRATION_COMPLETED: &str = "integration.completed";
    pub const INTEGRATION_FAILED: &str = "integration.failed";
    pub const INTEGRATION_CIRCUIT_STATE_CHANGED: &str = "integration.circuit_state_changed";

    // Workflow lifecycle events
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    pub const WORKFLOW_COMPLETED_WITH_ERRORS: &str = "workflow.completed_with_errors";
    pub const WORKFLOW_FAILED: &str = "workflow.failed";
    pub const WORKFLOW_CANCELLED: &str = "workflow.cancelled";

    // Step lifecycle events
    pub const STEP_STARTED: &str = "workflow.step.started";
    pub const STEP_SUCCEEDED: &str = "workflow.step.succeeded";
    pub const STEP_FAILED: &str = "workflow.step.failed";
    pub const STEP_SKIPPED: &str = "workflow.step.skipped";
    pub const STEP_COMPENSATED: &str = "workflow.step.compensated";

    /// Event type used to deliver an invocation to an event-bound worker
    pub fn invocation_event_type(target_id: &str) -> String {
        format!("integration.{target_id}.invoke")
    }
}

/// Event sources stamped on lifecycle events
pub mod sources {
    pub const INTEGRATION_MANAGER: &str = "integration_manager";
    pub const WORKFLOW_ORCHESTRATOR: &str = "workflow_orchestrator";
}

/// Default operating values used when no configuration is supplied
pub mod defaults {
    use super::Duration;

    pub const FAILURE_THRESHOLD: usize = 5;
    pub const RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);
    pub const HALF_OPEN_SUCCESS_THRESHOLD: usize = 2;

    pub const MAX_ATTEMPTS: u32 = 3;
    pub const BASE_DELAY: Duration = Duration::from_millis(100);
    pub const MAX_DELAY: Duration = Duration::from_secs(30);
    pub const BACKOFF_MULTIPLIER: f64 = 2.0;

    pub const POOL_CAPACITY: usize = 10;
    pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    pub const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
    pub const QUEUE_MAX_SIZE: usize = 10_000;
    pub const MESSAGE_MAX_RETRIES: u32 = 3;
    pub const MESSAGE_PRIORITY: u8 = 5;
    pub const MAX_MESSAGE_PRIORITY: u8 = 10;
    pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024;
    pub const CONSUMER_POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const CONSUMER_CONCURRENCY: usize = 16;

    pub const OBSERVER_CHANNEL_CAPACITY: usize = 1000;
    pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

    pub const MAX_CONCURRENT_STEPS: usize = 16;
    pub const STEP_TIMEOUT: Duration = Duration::from_secs(60);
}
