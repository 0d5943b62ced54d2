//! Step declarations and the immutable descriptors built from them.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engine::Token;

/// Pure check of whether a step's external dependencies are satisfied.
pub type Readiness<S> = Arc<dyn Fn(&S) -> bool + Send + Sync>;

/// Synchronous step body. Runs on a worker and returns its outcome directly.
pub type SyncRun<S> = Arc<dyn Fn(&Token<S>) -> anyhow::Result<()> + Send + Sync>;

/// Asynchronous step body. Returns quickly and completes the token later.
pub type AsyncRun<S> = Arc<dyn Fn(Token<S>) + Send + Sync>;

/// How a step reports completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// The run function's return value completes the step.
    Synchronous,

    /// The run function completes the step later through its token.
    Asynchronous,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepKind::Synchronous => "sync",
            StepKind::Asynchronous => "async",
        };
        write!(f, "{}", s)
    }
}

/// A step body of either kind.
pub enum Runner<S> {
    Sync(SyncRun<S>),
    Async(AsyncRun<S>),
}

impl<S> Runner<S> {
    /// The kind of step this body implements.
    pub fn kind(&self) -> StepKind {
        match self {
            Runner::Sync(_) => StepKind::Synchronous,
            Runner::Async(_) => StepKind::Asynchronous,
        }
    }
}

impl<S> Clone for Runner<S> {
    fn clone(&self) -> Self {
        match self {
            Runner::Sync(run) => Runner::Sync(Arc::clone(run)),
            Runner::Async(run) => Runner::Async(Arc::clone(run)),
        }
    }
}

/// Declaration of one step, as written by a workflow type.
///
/// ```
/// use stepwise::registry::StepDef;
///
/// struct Import {
///     rows: Vec<String>,
/// }
///
/// let def = StepDef::<Import>::new("parse")
///     .after(["download"])
///     .ready_when(|s| s.rows.is_empty())
///     .weight(2.0)
///     .run_sync(|_token| Ok(()));
/// assert_eq!(def.name(), "parse");
/// ```
pub struct StepDef<S> {
    pub(crate) name: String,
    pub(crate) after: Vec<String>,
    pub(crate) readiness: Option<Readiness<S>>,
    pub(crate) runner: Option<Runner<S>>,
    pub(crate) weight: Option<f32>,
}

impl<S> StepDef<S> {
    /// Start declaring a step with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            after: Vec::new(),
            readiness: None,
            runner: None,
            weight: None,
        }
    }

    /// Name of the declared step.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Require the named steps to be completed before this one may run.
    pub fn after<I, N>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        self.after.extend(steps.into_iter().map(Into::into));
        self
    }

    /// Gate the step on a predicate over workflow state.
    ///
    /// The predicate runs under the workflow lock and must not have side effects.
    pub fn ready_when<F>(mut self, readiness: F) -> Self
    where
        F: Fn(&S) -> bool + Send + Sync + 'static,
    {
        self.readiness = Some(Arc::new(readiness));
        self
    }

    /// Relative progress weight (defaults to 1.0).
    pub fn weight(mut self, weight: f32) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Run the step synchronously on a worker thread.
    pub fn run_sync<F>(mut self, run: F) -> Self
    where
        F: Fn(&Token<S>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.runner = Some(Runner::Sync(Arc::new(run)));
        self
    }

    /// Run the step asynchronously; the body must complete its token exactly once.
    pub fn run_async<F>(mut self, run: F) -> Self
    where
        F: Fn(Token<S>) + Send + Sync + 'static,
    {
        self.runner = Some(Runner::Async(Arc::new(run)));
        self
    }
}

impl<S> fmt::Debug for StepDef<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDef")
            .field("name", &self.name)
            .field("after", &self.after)
            .field("kind", &self.runner.as_ref().map(Runner::kind))
            .field("weight", &self.weight)
            .finish()
    }
}

/// Immutable, validated description of one step of a workflow type.
pub struct StepDescriptor<S> {
    pub(crate) name: String,
    pub(crate) readiness: Option<Readiness<S>>,
    pub(crate) predecessors: Vec<usize>,
    pub(crate) runner: Runner<S>,
    pub(crate) weight: f32,
    pub(crate) normalized_weight: f32,
}

impl<S> StepDescriptor<S> {
    /// Step name, unique within its registry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execution kind.
    pub fn kind(&self) -> StepKind {
        self.runner.kind()
    }

    /// Weight as declared.
    pub fn weight(&self) -> f32 {
        self.weight
    }

    /// Share of the workflow's total progress.
    pub fn normalized_weight(&self) -> f32 {
        self.normalized_weight
    }

    /// Registry indices of the declared predecessors.
    pub fn predecessors(&self) -> &[usize] {
        &self.predecessors
    }

    pub(crate) fn runner(&self) -> Runner<S> {
        self.runner.clone()
    }

    /// Whether the step's dependencies are satisfied.
    ///
    /// Predecessors are checked first; the predicate is only consulted once
    /// all of them are completed.
    pub(crate) fn is_ready(&self, state: &S, completed: impl Fn(usize) -> bool) -> bool {
        self.predecessors.iter().all(|&i| completed(i))
            && self.readiness.as_ref().map_or(true, |ready| ready(state))
    }
}

impl<S> fmt::Debug for StepDescriptor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("predecessors", &self.predecessors)
            .field("weight", &self.weight)
            .field("normalized_weight", &self.normalized_weight)
            .finish()
    }
}
