//! Notifications about workflow state transitions.

use std::sync::mpsc::Sender;

use crate::error::StepError;

/// A state transition, delivered to every subscriber in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    /// A step was dispatched.
    StepStarted { step: String },
    /// A running step reported progress.
    StepProgress { step: String, progress: f32 },
    /// A step completed successfully.
    StepCompleted { step: String },
    /// A step recorded errors.
    StepFailed {
        step: String,
        errors: Vec<StepError>,
    },
    /// A running step was cancelled by `stop`.
    StepCancelled { step: String },
    /// Every step completed.
    Completed,
    /// Nothing is running or runnable but the workflow is not complete.
    Stalled { failed: bool },
    /// `stop` cancelled the running steps.
    Stopped,
    /// `reset` returned every step to idle.
    Reset,
}

/// Fan-out of events to subscribers; disconnected receivers are dropped.
#[derive(Debug, Default)]
pub(crate) struct Subscribers {
    senders: Vec<Sender<WorkflowEvent>>,
}

impl Subscribers {
    pub(crate) fn add(&mut self, sender: Sender<WorkflowEvent>) {
        self.senders.push(sender);
    }

    pub(crate) fn emit(&mut self, event: WorkflowEvent) {
        self.senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.senders.len()
    }
}
