use crate::error::ErrorKind;
use crate::resilience::Classify;
use thiserror::Error;
use uuid::Uuid;

/// Workflow definition and instance errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("Workflow {workflow_id} has a dependency cycle among steps: {}", steps.join(", "))]
    CyclicWorkflow {
        workflow_id: String,
        steps: Vec<String>,
    },

    #[error("Workflow {workflow_id} has no steps")]
    EmptyWorkflow { workflow_id: String },

    #[error("Workflow {workflow_id} defines step {step_id} more than once")]
    DuplicateStep {
        workflow_id: String,
        step_id: String,
    },

    #[error("Step {step_id} of workflow {workflow_id} depends on unknown step {dependency}")]
    UnknownDependency {
        workflow_id: String,
        step_id: String,
        dependency: String,
    },

    #[error("Step {step_id} of workflow {workflow_id} requires {input}, which is not one of its dependencies")]
    InvalidRequiredInput {
        workflow_id: String,
        step_id: String,
        input: String,
    },

    #[error("Step {step_id} of workflow {workflow_id} targets unregistered worker {target_id}")]
    UnknownTarget {
        workflow_id: String,
        step_id: String,
        target_id: String,
    },

    #[error("Workflow instance not found: {instance_id}")]
    InstanceNotFound { instance_id: Uuid },

    #[error("Workflow instance {instance_id} has not finished")]
    InstanceNotFinished { instance_id: Uuid },

    #[error("Workflow instance {instance_id} aborted: {reason}")]
    ExecutionAborted { instance_id: Uuid, reason: String },
}

impl WorkflowError {
    pub fn cyclic(workflow_id: impl Into<String>, steps: Vec<String>) -> Self {
        Self::CyclicWorkflow {
            workflow_id: workflow_id.into(),
            steps,
        }
    }

    pub fn unknown_dependency(
        workflow_id: impl Into<String>,
        step_id: impl Into<String>,
        dependency: impl Into<String>,
    ) -> Self {
        Self::UnknownDependency {
            workflow_id: workflow_id.into(),
            step_id: step_id.into(),
            dependency: dependency.into(),
        }
    }

    pub fn instance_not_found(instance_id: Uuid) -> Self {
        Self::InstanceNotFound { instance_id }
    }

    pub fn is_cyclic(&self) -> bool {
        matches!(self, Self::CyclicWorkflow { .. })
    }
}

impl Classify for WorkflowError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InstanceNotFinished { .. } => ErrorKind::Transient,
            Self::ExecutionAborted { .. } => ErrorKind::System,
            _ => ErrorKind::Permanent,
        }
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;
