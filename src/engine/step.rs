//! Per-step execution state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StepError;

/// Scheduling status of a step, as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not completed and dependencies are not satisfied.
    UnmetDependency,

    /// Not completed and dependencies are satisfied.
    CanRun,

    /// Completed successfully.
    Completed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::UnmetDependency => "unmet_dependency",
            StepStatus::CanRun => "can_run",
            StepStatus::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

/// Position of a step in its execution state machine.
///
/// `Idle -> Running -> {Completed, Failed}`; a cancelled run returns to
/// `Idle`, and only a reset leaves the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Idle,
    Running,
    Completed,
    Failed,
}

impl StepState {
    /// Check if this is a terminal state (no more changes until reset).
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepState::Completed | StepState::Failed)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepState::Idle => "idle",
            StepState::Running => "running",
            StepState::Completed => "completed",
            StepState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Runtime state of one step within one workflow instance.
///
/// Only ever touched under the owning workflow's lock. The outstanding token
/// is tracked by id, so a stale token can never match again.
#[derive(Debug, Clone)]
pub(crate) struct Step {
    normalized_weight: f32,
    progress: f32,
    completed: bool,
    errors: Vec<StepError>,
    current_token: Option<u64>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub(crate) fn new(normalized_weight: f32) -> Self {
        Self {
            normalized_weight,
            progress: 0.0,
            completed: false,
            errors: Vec::new(),
            current_token: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.current_token.is_some()
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed
    }

    pub(crate) fn is_failed(&self) -> bool {
        !self.errors.is_empty()
    }

    pub(crate) fn errors(&self) -> &[StepError] {
        &self.errors
    }

    pub(crate) fn progress(&self) -> f32 {
        self.progress
    }

    pub(crate) fn normalized_weight(&self) -> f32 {
        self.normalized_weight
    }

    pub(crate) fn weighted_progress(&self) -> f32 {
        self.progress * self.normalized_weight
    }

    pub(crate) fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub(crate) fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub(crate) fn state(&self) -> StepState {
        if self.is_running() {
            StepState::Running
        } else if self.completed {
            StepState::Completed
        } else if self.is_failed() {
            StepState::Failed
        } else {
            StepState::Idle
        }
    }

    /// Status given the current readiness of the step's dependencies.
    pub(crate) fn status(&self, ready: bool) -> StepStatus {
        if self.completed {
            StepStatus::Completed
        } else if ready {
            StepStatus::CanRun
        } else {
            StepStatus::UnmetDependency
        }
    }

    /// Neither running nor in a terminal state.
    pub(crate) fn is_dispatchable(&self) -> bool {
        self.state() == StepState::Idle
    }

    /// Start an execution attempt under the given token id.
    ///
    /// Any earlier token id is forgotten, so its completion becomes stale.
    pub(crate) fn begin(&mut self, token: u64) {
        debug_assert!(!self.completed, "completed steps are never dispatched");
        self.current_token = Some(token);
        self.progress = 0.0;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
    }

    /// Whether the given token id is the outstanding one.
    pub(crate) fn accepts(&self, token: u64) -> bool {
        self.current_token == Some(token)
    }

    /// Mirror progress reported through a token, if that token is still valid.
    pub(crate) fn set_progress(&mut self, token: u64, progress: f32) -> bool {
        if !self.accepts(token) {
            return false;
        }
        self.progress = progress.clamp(0.0, 1.0);
        true
    }

    /// Record the result of an attempt.
    ///
    /// Returns `None` for a stale token. An empty error list completes the
    /// step; otherwise the errors are appended and progress drops back to 0.
    pub(crate) fn finish(&mut self, token: u64, errors: Vec<StepError>) -> Option<StepState> {
        if !self.accepts(token) {
            return None;
        }

        self.current_token = None;
        self.finished_at = Some(Utc::now());
        if errors.is_empty() {
            self.completed = true;
            self.progress = 1.0;
        } else {
            self.errors.extend(errors);
            self.progress = 0.0;
        }
        Some(self.state())
    }

    /// Invalidate the outstanding token without recording a result.
    pub(crate) fn cancel(&mut self) -> bool {
        if self.current_token.take().is_none() {
            return false;
        }
        self.progress = 0.0;
        self.started_at = None;
        true
    }

    /// Return to `Idle`. Callers must ensure the step is not running.
    pub(crate) fn reset(&mut self) {
        debug_assert!(!self.is_running(), "running steps are never reset");
        self.current_token = None;
        self.progress = 0.0;
        self.completed = false;
        self.errors.clear();
        self.started_at = None;
        self.finished_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_step_is_idle() {
        let step = Step::new(0.5);
        assert_eq!(step.state(), StepState::Idle);
        assert!(step.is_dispatchable());
        assert_eq!(step.progress(), 0.0);
        assert_eq!(step.weighted_progress(), 0.0);
    }

    #[test]
    fn status_follows_readiness() {
        let step = Step::new(1.0);
        assert_eq!(step.status(true), StepStatus::CanRun);
        assert_eq!(step.status(false), StepStatus::UnmetDependency);
    }

    #[test]
    fn begin_marks_running() {
        let mut step = Step::new(1.0);
        step.begin(1);
        assert_eq!(step.state(), StepState::Running);
        assert!(!step.is_dispatchable());
        assert!(step.accepts(1));
        assert!(!step.accepts(2));
        assert!(step.started_at().is_some());
    }

    #[test]
    fn successful_finish_completes() {
        let mut step = Step::new(0.25);
        step.begin(1);
        assert_eq!(step.finish(1, vec![]), Some(StepState::Completed));
        assert!(step.is_completed());
        assert!(!step.is_running());
        assert_eq!(step.progress(), 1.0);
        assert_eq!(step.weighted_progress(), 0.25);
        assert_eq!(step.status(false), StepStatus::Completed);
        assert!(step.finished_at().is_some());
    }

    #[test]
    fn failed_finish_records_errors_and_drops_progress() {
        let mut step = Step::new(1.0);
        step.begin(1);
        step.set_progress(1, 0.6);
        let state = step.finish(1, vec![StepError::msg("nope")]);
        assert_eq!(state, Some(StepState::Failed));
        assert!(step.is_failed());
        assert!(!step.is_completed());
        assert_eq!(step.progress(), 0.0);
        assert_eq!(step.errors()[0].to_string(), "nope");
        assert!(!step.is_dispatchable());
    }

    #[test]
    fn stale_token_is_ignored() {
        let mut step = Step::new(1.0);
        step.begin(1);
        step.begin(2);
        assert_eq!(step.finish(1, vec![]), None);
        assert!(!step.set_progress(1, 0.9));
        assert_eq!(step.state(), StepState::Running);
    }

    #[test]
    fn second_finish_is_ignored() {
        let mut step = Step::new(1.0);
        step.begin(7);
        step.finish(7, vec![]);
        assert_eq!(step.finish(7, vec![StepError::msg("late")]), None);
        assert!(!step.is_failed());
    }

    #[test]
    fn progress_is_clamped() {
        let mut step = Step::new(1.0);
        step.begin(1);
        step.set_progress(1, 4.0);
        assert_eq!(step.progress(), 1.0);
        step.set_progress(1, -2.0);
        assert_eq!(step.progress(), 0.0);
    }

    #[test]
    fn cancel_returns_to_idle() {
        let mut step = Step::new(1.0);
        step.begin(3);
        step.set_progress(3, 0.5);
        assert!(step.cancel());
        assert_eq!(step.state(), StepState::Idle);
        assert_eq!(step.progress(), 0.0);
        assert_eq!(step.finish(3, vec![]), None);
        assert!(!step.cancel());
    }

    #[test]
    fn reset_clears_terminal_state() {
        let mut step = Step::new(1.0);
        step.begin(1);
        step.finish(1, vec![StepError::msg("bad")]);
        step.reset();
        assert_eq!(step.state(), StepState::Idle);
        assert!(step.errors().is_empty());
        assert!(step.started_at().is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(StepState::Completed.is_terminal());
        assert!(StepState::Failed.is_terminal());
        assert!(!StepState::Running.is_terminal());
        assert!(!StepState::Idle.is_terminal());
    }

    #[test]
    fn display_is_snake_case() {
        assert_eq!(StepStatus::UnmetDependency.to_string(), "unmet_dependency");
        assert_eq!(StepState::Running.to_string(), "running");
    }
}
