//! # Orchestration Engine
//!
//! DAG workflow execution on top of the integration layer.
//!
//! ## Core Components
//!
//! - **DependencyGraph**: validation and level assignment for workflow definitions
//! - **WorkflowOrchestrator**: level-by-level execution with ROLLBACK / CONTINUE
//!   failure policies, cancellation and compensation
//! - **Types**: definitions, instances and per-step results

pub mod errors;
pub mod graph;
pub mod orchestrator;
pub mod types;

pub use errors::{WorkflowError, WorkflowResult};
pub use graph::DependencyGraph;
pub use orchestrator::WorkflowOrchestrator;
pub use types::{ErrorStrategy, StepResult, WorkflowDefinition, WorkflowInstance, WorkflowStep};
