//! Step and workflow outcomes.

use crate::step::StepType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// How a step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    /// A validate step that passed after one or more fix attempts.
    Fixed,
    Skipped,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn is_success(self) -> bool {
        matches!(self, StepStatus::Passed | StepStatus::Fixed | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepStatus::Passed => "passed",
            StepStatus::Fixed => "fixed",
            StepStatus::Skipped => "skipped",
            StepStatus::Failed => "failed",
            StepStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Result of a single step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Step name
    pub name: String,

    pub step_type: StepType,

    pub status: StepStatus,

    /// Step output (null when the step produced none)
    #[serde(default)]
    pub output: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Retry attempts made, or fix attempts for validate steps
    #[serde(default)]
    pub attempts: u32,

    /// Execution time in milliseconds
    #[serde(default)]
    pub duration_ms: u64,

    /// Results of nested steps (branch, parallel, fallbacks)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StepResult>,
}

impl StepResult {
    fn new(name: &str, step_type: StepType, status: StepStatus) -> Self {
        Self {
            name: name.to_string(),
            step_type,
            status,
            output: Value::Null,
            error: None,
            attempts: 0,
            duration_ms: 0,
            children: Vec::new(),
        }
    }

    pub fn passed(name: &str, step_type: StepType, output: Value) -> Self {
        Self {
            output,
            ..Self::new(name, step_type, StepStatus::Passed)
        }
    }

    pub fn failed(name: &str, step_type: StepType, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(name, step_type, StepStatus::Failed)
        }
    }

    pub fn skipped(name: &str, step_type: StepType, reason: Option<String>) -> Self {
        Self {
            error: reason,
            ..Self::new(name, step_type, StepStatus::Skipped)
        }
    }

    pub fn cancelled(name: &str, step_type: StepType) -> Self {
        Self::new(name, step_type, StepStatus::Cancelled)
    }

    pub fn success(&self) -> bool {
        self.status.is_success()
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_children(mut self, children: Vec<StepResult>) -> Self {
        self.children = children;
        self
    }

    /// Same outcome, ignoring timing.
    pub fn same_outcome(&self, other: &StepResult) -> bool {
        self.name == other.name
            && self.step_type == other.step_type
            && self.status == other.status
            && self.output == other.output
            && self.error == other.error
            && self.attempts == other.attempts
            && self.children.len() == other.children.len()
            && self
                .children
                .iter()
                .zip(&other.children)
                .all(|(a, b)| a.same_outcome(b))
    }
}

/// Lifecycle of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::Cancelled)
    }

    /// Whether a run may move from `self` to `next`.
    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::NotStarted, RunState::Running)
                | (RunState::Running, RunState::Completed)
                | (RunState::Running, RunState::Failed)
                | (RunState::Running, RunState::Cancelled)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::NotStarted => "not_started",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Result of workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_name: String,

    /// Run id used for checkpoints
    pub workflow_id: String,

    pub success: bool,

    /// One entry per top-level step, in declaration order
    pub step_results: Vec<StepResult>,

    pub cancelled: bool,

    /// Output of the last step that produced one
    #[serde(default)]
    pub final_output: Value,

    /// First blocking error, if the workflow failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Total execution time in milliseconds
    pub total_ms: u64,
}

impl WorkflowResult {
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.name == name)
    }

    /// Terminal state of the run.
    pub fn state(&self) -> RunState {
        if self.cancelled {
            RunState::Cancelled
        } else if self.success {
            RunState::Completed
        } else {
            RunState::Failed
        }
    }

    /// The first step that failed, if any.
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.step_results
            .iter()
            .find(|r| r.status == StepStatus::Failed)
    }

    /// Same outcome, ignoring timing and run id.
    pub fn same_outcome(&self, other: &WorkflowResult) -> bool {
        self.workflow_name == other.workflow_name
            && self.success == other.success
            && self.cancelled == other.cancelled
            && self.final_output == other.final_output
            && self.step_results.len() == other.step_results.len()
            && self
                .step_results
                .iter()
                .zip(&other.step_results)
                .all(|(a, b)| a.same_outcome(b))
    }
}
