use serde::{Deserialize, Serialize};
use std::fmt;

/// Workflow instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Instance accepted and steps are being scheduled
    Running,
    /// Every step succeeded
    Completed,
    /// Finished under CONTINUE with at least one failed step
    CompletedWithErrors,
    /// Finished under ROLLBACK after a failure, or cancelled
    Failed,
}

impl WorkflowStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Check if the instance finished without any failed step
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// RUNNING is the only state with outgoing transitions
    pub fn can_transition_to(&self, target: WorkflowStatus) -> bool {
        matches!(self, Self::Running) && target.is_terminal()
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::CompletedWithErrors => write!(f, "COMPLETED_WITH_ERRORS"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "COMPLETED_WITH_ERRORS" => Ok(Self::CompletedWithErrors),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid workflow status: {s}")),
        }
    }
}

/// Workflow step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Initial state; waiting for dependencies or a scheduling slot
    #[default]
    Pending,
    /// Step invocation is in progress
    Running,
    /// Step completed successfully
    Succeeded,
    /// Step failed with an error
    Failed,
    /// Step will never run (failed requirement, rollback, or cancellation)
    Skipped,
}

impl StepStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Check if this is an active state (step is being processed)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Check if this step's output can feed its dependents
    pub fn satisfies_dependencies(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// PENDING -> RUNNING -> {SUCCEEDED, FAILED}; PENDING/RUNNING -> SKIPPED
    pub fn can_transition_to(&self, target: StepStatus) -> bool {
        matches!(
            (self, target),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Skipped)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Skipped)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "SKIPPED"),
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "SKIPPED" => Ok(Self::Skipped),
            _ => Err(format!("Invalid step status: {s}")),
        }
    }
}
