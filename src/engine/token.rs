//! Tokens: single-use permission to run one step attempt and report its outcome.
//!
//! The scheduler creates a token right before dispatch and hands it to the
//! step's run function. Exactly one completion call is accepted per token;
//! later calls, and calls on a token invalidated by `stop`/`reset`, are
//! ignored. Tokens only hold a weak reference to their workflow, so an
//! outstanding token never keeps a dropped workflow alive.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::engine::workflow::{Outcome, Shared};
use crate::error::{StepError, StepErrors, StepPanicked};
use crate::registry::{Runner, StepKind};

/// Handle given to a step's run function for one execution attempt.
///
/// Cloning is cheap and all clones refer to the same attempt, so an
/// asynchronous step can move its token to whichever thread finishes the work.
pub struct Token<S> {
    inner: Arc<TokenInner<S>>,
}

struct TokenInner<S> {
    shared: Weak<Shared<S>>,
    step: usize,
    id: u64,
    name: String,
    kind: StepKind,
    progress: AtomicU32,
    guard: CompletionGuard,
}

/// Tracks whether a completion call was made and reports abandonment when
/// the last handle goes away without one.
struct CompletionGuard {
    finished: AtomicBool,
    on_abandon: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CompletionGuard {
    /// Mark finished; returns `false` if it already was.
    fn claim(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if *self.finished.get_mut() {
            return;
        }
        if let Some(on_abandon) = self.on_abandon.get_mut().take() {
            on_abandon();
        }
    }
}

impl<S> Clone for Token<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> fmt::Debug for Token<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("step", &self.inner.name)
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("finished", &self.inner.guard.is_finished())
            .finish()
    }
}

impl<S: Send + 'static> Token<S> {
    pub(crate) fn new(
        shared: &Arc<Shared<S>>,
        step: usize,
        id: u64,
        name: String,
        kind: StepKind,
    ) -> Self {
        let weak = Arc::downgrade(shared);

        let abandoned = Weak::clone(&weak);
        let on_abandon = move || {
            if let Some(shared) = abandoned.upgrade() {
                shared.abandon(step, id);
            }
        };

        Self {
            inner: Arc::new(TokenInner {
                shared: weak,
                step,
                id,
                name,
                kind,
                progress: AtomicU32::new(0.0f32.to_bits()),
                guard: CompletionGuard {
                    finished: AtomicBool::new(false),
                    on_abandon: Mutex::new(Some(Box::new(on_abandon))),
                },
            }),
        }
    }

    /// Name of the step this token belongs to.
    pub fn step_name(&self) -> &str {
        &self.inner.name
    }

    /// Kind of the step this token belongs to.
    pub fn kind(&self) -> StepKind {
        self.inner.kind
    }

    /// Whether this attempt is still the step's outstanding one.
    ///
    /// Turns false once the attempt completes, or when the workflow is
    /// stopped or dropped.
    pub fn is_valid(&self) -> bool {
        match self.inner.shared.upgrade() {
            Some(shared) => shared.is_current(self.inner.step, self.inner.id),
            None => false,
        }
    }

    /// Whether the workflow no longer wants this attempt's result.
    ///
    /// Run functions check this before doing state-changing work.
    pub fn is_stopping(&self) -> bool {
        !self.is_valid()
    }

    /// Last progress value reported through this token.
    pub fn progress(&self) -> f32 {
        f32::from_bits(self.inner.progress.load(Ordering::Acquire))
    }

    /// Report fractional progress; clamped to `[0, 1]`.
    ///
    /// Returns whether the value reached the step (the token is still valid).
    pub fn set_progress(&self, progress: f32) -> bool {
        if progress.is_nan() {
            return false;
        }
        let progress = progress.clamp(0.0, 1.0);
        self.inner
            .progress
            .store(progress.to_bits(), Ordering::Release);

        match self.inner.shared.upgrade() {
            Some(shared) => shared.report_progress(self.inner.step, self.inner.id, progress),
            None => false,
        }
    }

    /// Read workflow state under the workflow lock.
    ///
    /// Returns `None` if the workflow has been dropped. Do not call back into
    /// the workflow from `f`.
    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> Option<R> {
        let shared = self.inner.shared.upgrade()?;
        Some(shared.read_state(f))
    }

    /// Ask the workflow to re-evaluate readiness.
    pub fn poke(&self) {
        if let Some(shared) = self.inner.shared.upgrade() {
            shared.poke();
        }
    }

    /// Complete the step successfully.
    pub fn complete_successfully(&self) -> bool {
        self.finish(Outcome::Success(None))
    }

    /// Complete the step successfully and apply `update` to workflow state.
    ///
    /// `update` runs under the workflow lock, right after the step records
    /// success, and only if the token is still valid; a stopped workflow
    /// never sees the mutation.
    pub fn complete_with<F>(&self, update: F) -> bool
    where
        F: FnOnce(&mut S),
    {
        self.finish(Outcome::Success(Some(Box::new(update))))
    }

    /// Fail the step with one error.
    pub fn complete_with_error(&self, error: impl Into<anyhow::Error>) -> bool {
        self.finish(Outcome::Failure(vec![StepError::new(error.into())]))
    }

    /// Fail the step with several errors. An empty list completes it successfully.
    pub fn complete_with_errors<I, E>(&self, errors: I) -> bool
    where
        I: IntoIterator<Item = E>,
        E: Into<anyhow::Error>,
    {
        let errors: Vec<StepError> = errors
            .into_iter()
            .map(|e| StepError::new(e.into()))
            .collect();
        if errors.is_empty() {
            self.finish(Outcome::Success(None))
        } else {
            self.finish(Outcome::Failure(errors))
        }
    }

    /// First completion call wins; the step lock decides whether it still counts.
    fn finish(&self, outcome: Outcome<'_, S>) -> bool {
        if !self.inner.guard.claim() {
            debug!(
                "Ignoring repeated completion of step '{}' (token {})",
                self.inner.name, self.inner.id
            );
            return false;
        }

        match self.inner.shared.upgrade() {
            Some(shared) => shared.complete(self.inner.step, self.inner.id, outcome),
            None => false,
        }
    }

    /// Run one attempt on the current (worker) thread.
    ///
    /// Synchronous bodies complete the step with their return value unless
    /// they already completed it through the token. Asynchronous bodies are
    /// only invoked; completion arrives later. A panic fails the step.
    pub(crate) fn execute(self, runner: Runner<S>) {
        match runner {
            Runner::Sync(run) => {
                let result = panic::catch_unwind(AssertUnwindSafe(|| run(&self)));
                if self.inner.guard.is_finished() {
                    return;
                }
                let outcome = match result {
                    Ok(Ok(())) => Outcome::Success(None),
                    Ok(Err(error)) => {
                        let errors = StepErrors::flatten(error);
                        if errors.is_empty() {
                            Outcome::Success(None)
                        } else {
                            Outcome::Failure(errors)
                        }
                    }
                    Err(payload) => Outcome::Failure(vec![self.panic_error(payload)]),
                };
                self.finish(outcome);
            }
            Runner::Async(run) => {
                let token = self.clone();
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || run(token))) {
                    let error = self.panic_error(payload);
                    self.finish(Outcome::Failure(vec![error]));
                }
            }
        }
    }

    fn panic_error(&self, payload: Box<dyn Any + Send>) -> StepError {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        warn!("Step '{}' panicked: {}", self.inner.name, message);
        StepError::new(
            StepPanicked {
                step: self.inner.name.clone(),
                message,
            }
            .into(),
        )
    }
}
