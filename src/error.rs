//! Error types for workflow construction and execution.
//!
//! This module defines [`StepwiseError`], the error type for contract
//! violations (bad registries, misuse of `reset`, bad configuration), and
//! the value types used to carry errors produced by step run functions.
//!
//! # Error Handling Strategy
//!
//! - Use `StepwiseError` for failures of the engine's own contract
//! - Step run functions report failures as `anyhow::Error`; the engine
//!   stores them verbatim as [`StepError`] values
//! - A run function that needs to report several errors at once returns
//!   [`StepErrors`]

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Core error type for engine operations.
#[derive(Debug, Error)]
pub enum StepwiseError {
    /// Two declared steps share a name.
    #[error("Duplicate step name: {name}")]
    DuplicateStep { name: String },

    /// A step was declared with an empty name.
    #[error("Step names must not be empty")]
    EmptyStepName,

    /// A declared step has no run function.
    #[error("Step '{step}' has no run function")]
    MissingRunFunction { step: String },

    /// A progress weight is negative or not finite.
    #[error("Step '{step}' has invalid progress weight {weight}")]
    InvalidWeight { step: String, weight: f32 },

    /// A step names a predecessor that was never declared.
    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// Declared predecessors form a cycle.
    #[error("Circular dependency detected: {cycle}")]
    CircularDependency { cycle: String },

    /// A workflow type declared no steps.
    #[error("A workflow must declare at least one step")]
    EmptyRegistry,

    /// `reset` was called while steps were still running.
    #[error("Cannot reset while steps are running: {}", .running.join(", "))]
    ResetWhileRunning { running: Vec<String> },

    /// Options file not found at expected location.
    #[error("Configuration not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Failed to parse an options file.
    #[error("Failed to parse config at {path}: {message}")]
    ConfigParseError { path: PathBuf, message: String },

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic wrapped error for anyhow interop.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, StepwiseError>;

/// An error recorded by a step.
///
/// Wraps the `anyhow::Error` the run function produced without altering it.
/// Cloning is cheap, so aggregate accessors can hand out copies while the
/// step keeps its own.
#[derive(Clone)]
pub struct StepError(Arc<anyhow::Error>);

impl StepError {
    /// Wrap an error produced by a run function.
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    /// Create an error from a plain message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::new(anyhow::Error::msg(message))
    }

    /// The recorded error.
    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }

    /// Downcast the recorded error to a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl From<anyhow::Error> for StepError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(error)
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl fmt::Debug for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl PartialEq for StepError {
    /// Two values are equal when they share the same recorded error.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Several errors reported by a single step attempt.
///
/// Return this from a synchronous run function (via `Err(StepErrors(..).into())`)
/// to record each error individually. An empty list counts as success.
#[derive(Debug, Error)]
#[error("{} step error(s)", .0.len())]
pub struct StepErrors(pub Vec<anyhow::Error>);

impl StepErrors {
    /// Unpack an error returned by a run function into recorded errors.
    pub(crate) fn flatten(error: anyhow::Error) -> Vec<StepError> {
        match error.downcast::<StepErrors>() {
            Ok(many) => many.0.into_iter().map(StepError::new).collect(),
            Err(single) => vec![StepError::new(single)],
        }
    }
}

/// Error recorded when a run function panics.
#[derive(Debug, Error)]
#[error("Step '{step}' panicked: {message}")]
pub struct StepPanicked {
    pub step: String,
    pub message: String,
}

/// Error recorded when every handle to a valid token is dropped without completing it.
#[derive(Debug, Error)]
#[error("Step '{step}' abandoned its token without completing")]
pub struct TokenAbandoned {
    pub step: String,
}

/// Error recorded when a worker could not be started for a step.
#[derive(Debug, Error)]
#[error("Failed to start worker for step '{step}': {source}")]
pub struct WorkerSpawnFailed {
    pub step: String,
    #[source]
    pub source: std::io::Error,
}
