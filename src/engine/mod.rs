//! The step-scheduling and completion-handling engine.
//!
//! - [`Workflow`] - owns the steps, exposes start/stop/reset/poke and aggregates
//! - [`Token`] - one execution attempt, completed exactly once
//! - [`Dispatch`] - where step bodies run ([`ThreadDispatcher`], [`InlineDispatcher`])
//! - [`WorkflowEvent`] - state transitions, delivered to subscribers
//! - [`WorkflowSnapshot`] - a consistent view taken under the workflow lock

pub mod dispatch;
pub mod event;
pub mod snapshot;
pub mod step;
pub mod token;
pub mod workflow;

pub use dispatch::{Dispatch, InlineDispatcher, Job, ThreadDispatcher};
pub use event::WorkflowEvent;
pub use snapshot::{StepSnapshot, WorkflowSnapshot, WorkflowStatus};
pub use step::{StepState, StepStatus};
pub use token::Token;
pub use workflow::Workflow;
