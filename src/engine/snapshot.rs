//! Point-in-time views of a workflow, taken under its lock.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::engine::step::{StepState, StepStatus};
use crate::error::StepError;
use crate::registry::StepKind;

/// Aggregate status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Not started (or stopped) and not finished.
    Idle,
    /// At least one step is running and none has failed.
    Running,
    /// Started, nothing running, waiting on an unmet dependency.
    Waiting,
    /// Every step completed.
    Completed,
    /// At least one step recorded errors.
    Failed,
}

impl WorkflowStatus {
    pub(crate) fn derive(enabled: bool, running: bool, completed: bool, failed: bool) -> Self {
        if completed {
            WorkflowStatus::Completed
        } else if failed {
            WorkflowStatus::Failed
        } else if running {
            WorkflowStatus::Running
        } else if enabled {
            WorkflowStatus::Waiting
        } else {
            WorkflowStatus::Idle
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Idle => "idle",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Waiting => "waiting",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// One step as of a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StepSnapshot {
    pub name: String,
    pub kind: StepKind,
    pub state: StepState,
    pub status: StepStatus,
    /// Own progress in `[0, 1]`.
    pub progress: f32,
    /// Normalized share of the workflow's progress.
    pub weight: f32,
    #[serde(serialize_with = "errors_as_strings")]
    pub errors: Vec<StepError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A consistent view of a whole workflow.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    pub name: String,
    pub status: WorkflowStatus,
    pub enabled: bool,
    pub running: bool,
    pub completed: bool,
    pub failed: bool,
    pub progress: f32,
    pub steps: Vec<StepSnapshot>,
}

impl WorkflowSnapshot {
    /// All recorded errors in step declaration order.
    pub fn errors(&self) -> Vec<StepError> {
        self.steps
            .iter()
            .flat_map(|s| s.errors.iter().cloned())
            .collect()
    }

    /// Look up a step by name.
    pub fn step(&self, name: &str) -> Option<&StepSnapshot> {
        self.steps.iter().find(|s| s.name == name)
    }
}

#[allow(clippy::ptr_arg)]
fn errors_as_strings<S: Serializer>(errors: &Vec<StepError>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(errors.iter().map(|e| e.to_string()))
}
