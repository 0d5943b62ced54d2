//! Stepwise - a declarative, dependency-gated workflow engine.
//!
//! A workflow type declares an ordered list of named steps. Each step has a
//! readiness check over the workflow's state (and optionally named
//! predecessors), a progress weight, and a synchronous or asynchronous body.
//! Whenever state changes, the engine re-evaluates readiness ("poke") and
//! dispatches every step that became runnable, tracking weighted progress
//! and per-step errors.
//!
//! # Modules
//!
//! - [`config`] - Workflow and worker options, YAML loading
//! - [`engine`] - Scheduling, tokens, dispatch, events and snapshots
//! - [`error`] - Error types and result aliases
//! - [`registry`] - Step declarations and per-type registries
//!
//! # Example
//!
//! ```
//! use stepwise::{Definition, RegistryBuilder, StepDef, Workflow};
//! use std::time::Duration;
//!
//! #[derive(Default)]
//! struct Import {
//!     raw: Option<String>,
//!     rows: usize,
//! }
//!
//! impl Definition for Import {
//!     fn steps(registry: RegistryBuilder<Self>) -> RegistryBuilder<Self> {
//!         registry
//!             .step(StepDef::new("download").weight(3.0).run_async(|token| {
//!                 std::thread::spawn(move || {
//!                     token.set_progress(0.5);
//!                     token.complete_with(|s: &mut Import| s.raw = Some("a\nb\nc".into()));
//!                 });
//!             }))
//!             .step(
//!                 StepDef::new("parse")
//!                     .ready_when(|s: &Import| s.raw.is_some())
//!                     .run_sync(|token| {
//!                         let rows = token.read(|s| s.raw.as_deref().unwrap_or("").lines().count());
//!                         token.complete_with(move |s: &mut Import| s.rows = rows.unwrap_or(0));
//!                         Ok(())
//!                     }),
//!             )
//!     }
//! }
//!
//! let workflow = Workflow::new(Import::default()).unwrap();
//! workflow.start();
//! assert!(workflow.wait_idle(Duration::from_secs(5)));
//! assert!(workflow.is_completed());
//! assert_eq!(workflow.state(|s| s.rows), 3);
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod registry;

pub use config::{WorkerOptions, WorkflowOptions};
pub use engine::{
    Dispatch, InlineDispatcher, StepSnapshot, StepState, StepStatus, ThreadDispatcher, Token,
    Workflow, WorkflowEvent, WorkflowSnapshot, WorkflowStatus,
};
pub use error::{Result, StepError, StepErrors, StepwiseError};
pub use registry::{Definition, RegistryBuilder, StepDef, StepKind, StepRegistry};
