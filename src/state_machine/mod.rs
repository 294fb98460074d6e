// Step and workflow instance states with their legal transitions

pub mod states;

pub use states::{StepStatus, WorkflowStatus};
