#![allow(clippy::doc_markdown)] // Allow technical terms like YAML, DAG in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker Flow
//!
//! Resilient integration and DAG workflow orchestration in a single process.
//!
//! ## Overview
//!
//! Tasker Flow invokes external workers behind circuit breakers, retries with
//! exponential backoff and per-resource-class bulkheads. Invocations travel
//! directly, through an in-memory message queue, over the event bus, or as a
//! stream. Workflows are DAGs of steps executed level by level on top of that
//! integration layer.
//!
//! ## Module Organization
//!
//! - [`resilience`] - Circuit breakers, retry executor and bulkheads
//! - [`messaging`] - Named queues with visibility timeouts and dead letters
//! - [`events`] - Pattern-based publish/subscribe with per-subscriber dead letters
//! - [`integration`] - Worker registry and invocation strategies
//! - [`orchestration`] - Workflow definitions, dependency graphs and execution
//! - [`state_machine`] - Workflow and step status transitions
//! - [`config`] - YAML configuration with environment overrides
//! - [`error`] - Failure taxonomy and the crate-level error type
//! - [`logging`] - Structured console and file logging
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tasker_flow::events::EventBus;
//! use tasker_flow::integration::{FnWorker, IntegrationManager, InvocationRequest};
//! use tasker_flow::messaging::MessageQueue;
//! use tasker_flow::orchestration::{ErrorStrategy, WorkflowDefinition, WorkflowOrchestrator, WorkflowStep};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let integration = Arc::new(IntegrationManager::new(
//!     Arc::new(EventBus::new()),
//!     Arc::new(MessageQueue::new()),
//! ));
//! integration.register_worker(
//!     "echo",
//!     FnWorker::new(|request: InvocationRequest| async move { Ok(request.payload) }),
//! )?;
//!
//! let definition = WorkflowDefinition::new("order", ErrorStrategy::Rollback)
//!     .with_step(WorkflowStep::new("validate", "echo"))
//!     .with_step(WorkflowStep::new("charge", "echo").depends_on(["validate"]));
//!
//! let orchestrator = WorkflowOrchestrator::new(integration);
//! let instance = orchestrator.execute(definition, json!({"orderId": 42})).await?;
//! println!("workflow finished: {}", instance.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod integration;
pub mod logging;
pub mod messaging;
pub mod orchestration;
pub mod resilience;
pub mod state_machine;

pub use config::{ConfigManager, TaskerFlowConfig};
pub use error::{ErrorKind, Result, TaskerError};
pub use events::{Event, EventBus};
pub use integration::{IntegrationManager, IntegrationTarget, InvocationStrategy, Worker};
pub use messaging::MessageQueue;
pub use orchestration::{ErrorStrategy, WorkflowDefinition, WorkflowOrchestrator, WorkflowStep};
pub use resilience::{CircuitBreaker, CircuitState, RetryPolicy};
pub use state_machine::{StepStatus, WorkflowStatus};
