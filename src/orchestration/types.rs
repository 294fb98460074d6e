//! Workflow definitions, instances and step results.

use crate::state_machine::{StepStatus, WorkflowStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// What a step failure does to the rest of the workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorStrategy {
    /// Skip every not-yet-started dependent of the failed step; the instance fails
    #[serde(alias = "rollback")]
    Rollback,
    /// Keep going; dependents that don't require the failed output still run
    #[default]
    #[serde(alias = "continue")]
    Continue,
}

impl fmt::Display for ErrorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rollback => write!(f, "ROLLBACK"),
            Self::Continue => write!(f, "CONTINUE"),
        }
    }
}

impl std::str::FromStr for ErrorStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rollback" => Ok(Self::Rollback),
            "continue" => Ok(Self::Continue),
            _ => Err(format!("Invalid error strategy: {s}")),
        }
    }
}

fn default_parallelizable() -> bool {
    true
}

/// One node of a workflow DAG
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    pub target_worker_id: String,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Per-invocation timeout; the orchestrator default applies when unset
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// `false` makes the step run alone within its level
    #[serde(default = "default_parallelizable")]
    pub parallelizable: bool,
    /// Dependencies whose failure skips this step even under CONTINUE
    #[serde(default)]
    pub required_inputs: BTreeSet<String>,
    /// Target invoked to undo this step when a ROLLBACK workflow fails
    #[serde(default)]
    pub compensation_target: Option<String>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, target_worker_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target_worker_id: target_worker_id.into(),
            depends_on: BTreeSet::new(),
            timeout: None,
            parallelizable: true,
            required_inputs: BTreeSet::new(),
            compensation_target: None,
        }
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    /// Depend on `dependency` and be skipped whenever it doesn't succeed
    pub fn requires(mut self, dependency: impl Into<String>) -> Self {
        let dependency = dependency.into();
        self.depends_on.insert(dependency.clone());
        self.required_inputs.insert(dependency);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn sequential(mut self) -> Self {
        self.parallelizable = false;
        self
    }

    pub fn with_compensation(mut self, target: impl Into<String>) -> Self {
        self.compensation_target = Some(target.into());
        self
    }
}

/// A DAG of steps plus the failure policy applied to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, error_strategy: ErrorStrategy) -> Self {
        Self {
            id: id.into(),
            steps: Vec::new(),
            error_strategy,
        }
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}

/// Outcome of one step within an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration: Duration,
    /// Invocation attempts made by the integration layer
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            output: None,
            error: None,
            duration: Duration::ZERO,
            attempts: 0,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One execution of a [`WorkflowDefinition`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition_id: String,
    pub status: WorkflowStatus,
    pub error_strategy: ErrorStrategy,
    pub step_results: BTreeMap<String, StepResult>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub cancelled: bool,
    /// Steps whose compensation target succeeded, in the order they were undone
    #[serde(default)]
    pub compensated_steps: Vec<String>,
}

impl WorkflowInstance {
    pub fn new(definition: &WorkflowDefinition) -> Self {
        Self {
            id: Uuid::new_v4(),
            definition_id: definition.id.clone(),
            status: WorkflowStatus::Running,
            error_strategy: definition.error_strategy,
            step_results: definition
                .steps
                .iter()
                .map(|s| (s.id.clone(), StepResult::pending(s.id.clone())))
                .collect(),
            start_time: Utc::now(),
            end_time: None,
            cancelled: false,
            compensated_steps: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.get(step_id)
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.step_results.get(step_id).map(|r| r.status)
    }

    pub fn steps_with_status(&self, status: StepStatus) -> Vec<&str> {
        self.step_results
            .values()
            .filter(|r| r.status == status)
            .map(|r| r.step_id.as_str())
            .collect()
    }

    pub fn all_steps_terminal(&self) -> bool {
        self.step_results.values().all(StepResult::is_terminal)
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}
