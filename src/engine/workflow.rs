//! Workflow orchestration.
//!
//! A [`Workflow`] owns one runtime step per registry descriptor plus the
//! caller's state, all behind a single mutex. Poking scans the steps in
//! declaration order and dispatches every one that is idle and ready; each
//! completion records its result and re-scans under the same lock, so a
//! downstream step is marked running before anyone can observe the workflow
//! as idle. Run functions themselves execute outside the lock.

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::WorkflowOptions;
use crate::engine::dispatch::{Dispatch, Job, ThreadDispatcher};
use crate::engine::event::{Subscribers, WorkflowEvent};
use crate::engine::snapshot::{StepSnapshot, WorkflowSnapshot, WorkflowStatus};
use crate::engine::step::{Step, StepState, StepStatus};
use crate::engine::token::Token;
use crate::error::{Result, StepError, StepwiseError, TokenAbandoned, WorkerSpawnFailed};
use crate::registry::{Definition, Runner, StepRegistry};

/// Result of one attempt, as handed to the step by its token.
pub(crate) enum Outcome<'a, S> {
    /// Success, with an optional state update applied while the lock is held.
    Success(Option<Box<dyn FnOnce(&mut S) + 'a>>),
    Failure(Vec<StepError>),
}

/// State shared by a workflow's handles and its outstanding tokens.
pub(crate) struct Shared<S> {
    registry: Arc<StepRegistry<S>>,
    options: WorkflowOptions,
    dispatcher: Arc<dyn Dispatch>,
    core: Mutex<Core<S>>,
    idle: Condvar,
    /// `(step, token)` pairs whose last handle was dropped without completing.
    abandoned: Mutex<Vec<(usize, u64)>>,
}

/// Everything guarded by the workflow lock.
struct Core<S> {
    state: S,
    steps: Vec<Step>,
    enabled: bool,
    /// Set once the current stall/completion has been announced.
    settled: bool,
    next_token: u64,
    subscribers: Subscribers,
}

impl<S> Core<S> {
    fn any_running(&self) -> bool {
        self.steps.iter().any(Step::is_running)
    }

    fn all_completed(&self) -> bool {
        self.steps.iter().all(Step::is_completed)
    }

    fn any_failed(&self) -> bool {
        self.steps.iter().any(Step::is_failed)
    }

    fn overall_progress(&self) -> f32 {
        let total: f32 = self.steps.iter().map(Step::weighted_progress).sum();
        total.clamp(0.0, 1.0)
    }

    fn errors(&self) -> Vec<StepError> {
        self.steps
            .iter()
            .flat_map(|s| s.errors().iter().cloned())
            .collect()
    }

    fn status(&self) -> WorkflowStatus {
        WorkflowStatus::derive(
            self.enabled,
            self.any_running(),
            self.all_completed(),
            self.any_failed(),
        )
    }
}

/// The workflow lock. Releasing it drains abandoned tokens.
struct CoreGuard<'a, S: Send + 'static> {
    // Field order matters: the lock is released before the drain runs
    guard: MutexGuard<'a, Core<S>>,
    _drain: DrainAbandoned<'a, S>,
}

struct DrainAbandoned<'a, S: Send + 'static>(&'a Arc<Shared<S>>);

impl<S: Send + 'static> Drop for DrainAbandoned<'_, S> {
    fn drop(&mut self) {
        self.0.drain_abandoned();
    }
}

impl<S: Send + 'static> Deref for CoreGuard<'_, S> {
    type Target = Core<S>;

    fn deref(&self) -> &Core<S> {
        &self.guard
    }
}

impl<S: Send + 'static> DerefMut for CoreGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut Core<S> {
        &mut self.guard
    }
}

/// A dispatched step waiting to be handed to the dispatcher.
struct Launch<S> {
    token: Token<S>,
    runner: Runner<S>,
}

impl<S: Send + 'static> Shared<S> {
    fn name(&self) -> &str {
        &self.options.name
    }

    fn lock(self: &Arc<Self>) -> CoreGuard<'_, S> {
        CoreGuard {
            guard: self.core.lock(),
            _drain: DrainAbandoned(self),
        }
    }

    /// Record that a valid token lost its last handle.
    ///
    /// Never blocks on the workflow lock: the drop may happen inside a closure
    /// that already holds it, in which case the holder drains on release.
    pub(crate) fn abandon(self: &Arc<Self>, step: usize, token: u64) {
        self.abandoned.lock().push((step, token));
        if let Some(guard) = self.core.try_lock() {
            drop(guard);
            self.drain_abandoned();
        }
    }

    fn drain_abandoned(self: &Arc<Self>) {
        loop {
            let pending = mem::take(&mut *self.abandoned.lock());
            if pending.is_empty() {
                return;
            }
            for (step, token) in pending {
                let name = self.step_name(step).to_string();
                let error = TokenAbandoned { step: name.clone() };
                let outcome = Outcome::Failure(vec![StepError::new(error.into())]);
                if self.complete(step, token, outcome) {
                    warn!(
                        workflow = %self.name(),
                        "Step '{}' dropped its token without completing",
                        name
                    );
                }
            }
        }
    }

    fn step_name(&self, index: usize) -> &str {
        self.registry.steps()[index].name()
    }

    fn is_ready(&self, core: &Core<S>, index: usize) -> bool {
        let steps = &core.steps;
        self.registry.steps()[index].is_ready(&core.state, |i| steps[i].is_completed())
    }

    fn status_of(&self, core: &Core<S>, index: usize) -> StepStatus {
        let step = &core.steps[index];
        if step.is_completed() {
            return StepStatus::Completed;
        }
        step.status(self.is_ready(core, index))
    }

    pub(crate) fn is_current(self: &Arc<Self>, step: usize, token: u64) -> bool {
        self.lock().steps[step].accepts(token)
    }

    pub(crate) fn read_state<R>(self: &Arc<Self>, f: impl FnOnce(&S) -> R) -> R {
        f(&self.lock().state)
    }

    pub(crate) fn report_progress(self: &Arc<Self>, step: usize, token: u64, progress: f32) -> bool {
        let mut core = self.lock();
        if !core.steps[step].set_progress(token, progress) {
            return false;
        }
        core.subscribers.emit(WorkflowEvent::StepProgress {
            step: self.step_name(step).to_string(),
            progress,
        });
        true
    }

    /// Mark every idle, ready step as running and prepare its launch.
    fn schedule(self: &Arc<Self>, core: &mut Core<S>) -> Vec<Launch<S>> {
        let mut launches = Vec::new();
        if !core.enabled {
            return launches;
        }

        for index in 0..core.steps.len() {
            if !core.steps[index].is_dispatchable() || !self.is_ready(core, index) {
                continue;
            }

            core.next_token += 1;
            let id = core.next_token;
            core.steps[index].begin(id);
            core.settled = false;

            let descriptor = &self.registry.steps()[index];
            debug!(
                workflow = %self.name(),
                "Dispatching step '{}' ({}, token {})",
                descriptor.name(),
                descriptor.kind(),
                id
            );
            core.subscribers.emit(WorkflowEvent::StepStarted {
                step: descriptor.name().to_string(),
            });
            launches.push(Launch {
                token: Token::new(
                    self,
                    index,
                    id,
                    descriptor.name().to_string(),
                    descriptor.kind(),
                ),
                runner: descriptor.runner(),
            });
        }

        launches
    }

    /// Announce completion or a stall once nothing is running.
    fn settle(&self, core: &mut Core<S>) {
        if core.any_running() {
            return;
        }
        self.idle.notify_all();

        if !core.enabled || core.settled {
            return;
        }
        core.settled = true;

        if core.all_completed() {
            info!(workflow = %self.name(), "Workflow completed");
            core.subscribers.emit(WorkflowEvent::Completed);
        } else {
            let failed = core.any_failed();
            if failed {
                warn!(
                    workflow = %self.name(),
                    "Workflow stalled with {} error(s)",
                    core.errors().len()
                );
            } else {
                debug!(workflow = %self.name(), "Workflow waiting on unmet dependencies");
            }
            core.subscribers.emit(WorkflowEvent::Stalled { failed });
        }
    }

    /// Hand prepared launches to the dispatcher, outside the lock.
    fn launch(&self, launches: Vec<Launch<S>>) {
        for Launch { token, runner } in launches {
            let fallback = token.clone();
            let step = token.step_name().to_string();
            let job: Job = Box::new(move || token.execute(runner));

            if let Err(source) = self.dispatcher.spawn(&step, job) {
                warn!(
                    workflow = %self.name(),
                    "Failed to start worker for step '{}': {}",
                    step,
                    source
                );
                fallback.complete_with_error(WorkerSpawnFailed { step, source });
            }
        }
    }

    /// Dispatch runnable steps until a scan finds nothing new.
    pub(crate) fn poke(self: &Arc<Self>) {
        loop {
            let launches = {
                let mut core = self.lock();
                let launches = self.schedule(&mut core);
                if launches.is_empty() {
                    self.settle(&mut core);
                }
                launches
            };

            if launches.is_empty() {
                break;
            }
            self.launch(launches);
        }
    }

    /// Apply a token's outcome if the token is still the step's outstanding one.
    pub(crate) fn complete(self: &Arc<Self>, step: usize, token: u64, outcome: Outcome<'_, S>) -> bool {
        let (errors, update) = match outcome {
            Outcome::Success(update) => (Vec::new(), update),
            Outcome::Failure(errors) => (errors, None),
        };
        let recorded = errors.clone();
        let name = self.step_name(step);

        let launches = {
            let mut core = self.lock();

            match core.steps[step].finish(token, errors) {
                None => {
                    debug!(
                        workflow = %self.name(),
                        "Ignoring stale completion of step '{}' (token {})",
                        name,
                        token
                    );
                    return false;
                }
                Some(StepState::Completed) => {
                    if let Some(update) = update {
                        update(&mut core.state);
                    }
                    info!(workflow = %self.name(), "Step '{}' completed", name);
                    core.subscribers.emit(WorkflowEvent::StepCompleted {
                        step: name.to_string(),
                    });
                }
                Some(_) => {
                    for error in &recorded {
                        warn!(workflow = %self.name(), "Step '{}' failed: {}", name, error);
                    }
                    let blocked = self.registry.graph().blocked_by(name);
                    if !blocked.is_empty() {
                        warn!(
                            workflow = %self.name(),
                            "Steps blocked by '{}': {}",
                            name,
                            blocked.join(", ")
                        );
                    }
                    core.subscribers.emit(WorkflowEvent::StepFailed {
                        step: name.to_string(),
                        errors: recorded,
                    });
                }
            }

            let launches = self.schedule(&mut core);
            if launches.is_empty() {
                self.settle(&mut core);
            }
            launches
        };

        if !launches.is_empty() {
            self.launch(launches);
            self.poke();
        }
        true
    }
}

/// A running instance of a workflow type.
///
/// Handles are cheap to clone and may be shared across threads; every clone
/// controls the same instance.
///
/// ```
/// use stepwise::{InlineDispatcher, StepDef, StepRegistry, Workflow, WorkflowOptions};
/// use std::sync::Arc;
///
/// #[derive(Default)]
/// struct Build {
///     compiled: bool,
/// }
///
/// let registry = StepRegistry::<Build>::builder()
///     .step(StepDef::new("compile").run_sync(|token| {
///         token.complete_with(|s: &mut Build| s.compiled = true);
///         Ok(())
///     }))
///     .step(StepDef::new("test").ready_when(|s: &Build| s.compiled).run_sync(|_| Ok(())))
///     .build()
///     .unwrap();
///
/// let workflow = Workflow::with_dispatcher(
///     Arc::new(registry),
///     Build::default(),
///     WorkflowOptions::named("build"),
///     Arc::new(InlineDispatcher),
/// );
/// workflow.start();
/// assert!(workflow.is_completed());
/// assert_eq!(workflow.overall_progress(), 1.0);
/// ```
pub struct Workflow<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for Workflow<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Definition> Workflow<S> {
    /// Create an instance of a [`Definition`] type with default options.
    pub fn new(state: S) -> Result<Self> {
        Self::with_options(state, WorkflowOptions::default())
    }

    /// Create an instance of a [`Definition`] type.
    pub fn with_options(state: S, options: WorkflowOptions) -> Result<Self> {
        let registry = StepRegistry::<S>::of()?;
        Ok(Self::with_registry(registry, state, options))
    }
}

impl<S: Send + 'static> Workflow<S> {
    /// Create an instance over an explicit registry, running steps on threads.
    pub fn with_registry(registry: Arc<StepRegistry<S>>, state: S, options: WorkflowOptions) -> Self {
        let dispatcher = Arc::new(ThreadDispatcher::new(options.worker.clone()));
        Self::with_dispatcher(registry, state, options, dispatcher)
    }

    /// Create an instance with a custom dispatcher.
    pub fn with_dispatcher(
        registry: Arc<StepRegistry<S>>,
        state: S,
        options: WorkflowOptions,
        dispatcher: Arc<dyn Dispatch>,
    ) -> Self {
        let steps = registry
            .steps()
            .iter()
            .map(|d| Step::new(d.normalized_weight()))
            .collect();

        Self {
            shared: Arc::new(Shared {
                registry,
                options,
                dispatcher,
                core: Mutex::new(Core {
                    state,
                    steps,
                    enabled: false,
                    settled: false,
                    next_token: 0,
                    subscribers: Subscribers::default(),
                }),
                idle: Condvar::new(),
                abandoned: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Workflow name from its options.
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// The registry this instance was built from.
    pub fn registry(&self) -> &Arc<StepRegistry<S>> {
        &self.shared.registry
    }

    /// Enable scheduling and dispatch every runnable step.
    ///
    /// Does nothing if a step is running, or the workflow already completed
    /// or failed.
    pub fn start(&self) {
        {
            let mut core = self.shared.lock();
            if core.any_running() || core.all_completed() || core.any_failed() {
                debug!(
                    workflow = %self.name(),
                    "Ignoring start while {}",
                    core.status()
                );
                return;
            }
            if !core.enabled {
                info!(
                    workflow = %self.name(),
                    "Starting workflow with {} step(s)",
                    core.steps.len()
                );
            }
            core.enabled = true;
        }
        self.shared.poke();
    }

    /// Cancel running steps and disable scheduling.
    ///
    /// Does nothing unless a step is running. Cancelled steps return to idle;
    /// late completions from their run functions are ignored.
    pub fn stop(&self) {
        let mut core = self.shared.lock();
        if !core.any_running() || core.all_completed() {
            return;
        }

        let cancelled: Vec<usize> = core
            .steps
            .iter_mut()
            .enumerate()
            .filter_map(|(i, step)| step.cancel().then_some(i))
            .collect();
        for index in cancelled {
            let step = self.shared.step_name(index).to_string();
            debug!(workflow = %self.name(), "Cancelled step '{}'", step);
            core.subscribers.emit(WorkflowEvent::StepCancelled { step });
        }

        core.enabled = false;
        core.settled = false;
        info!(workflow = %self.name(), "Workflow stopped");
        core.subscribers.emit(WorkflowEvent::Stopped);
        self.shared.idle.notify_all();
    }

    /// Return every step to idle and clear recorded errors.
    ///
    /// Fails if any step is running; call [`stop`](Self::stop) first.
    pub fn reset(&self) -> Result<()> {
        self.reset_with(|_| {})
    }

    /// Reset steps and apply `f` to the state in the same critical section.
    pub fn reset_with(&self, f: impl FnOnce(&mut S)) -> Result<()> {
        let mut core = self.shared.lock();

        let running: Vec<String> = core
            .steps
            .iter()
            .enumerate()
            .filter(|(_, step)| step.is_running())
            .map(|(i, _)| self.shared.step_name(i).to_string())
            .collect();
        if !running.is_empty() {
            return Err(StepwiseError::ResetWhileRunning { running });
        }

        core.steps.iter_mut().for_each(Step::reset);
        core.enabled = false;
        core.settled = false;
        f(&mut core.state);

        info!(workflow = %self.name(), "Workflow reset");
        core.subscribers.emit(WorkflowEvent::Reset);
        Ok(())
    }

    /// Re-evaluate readiness and dispatch newly runnable steps.
    ///
    /// Does nothing unless the workflow has been started.
    pub fn poke(&self) {
        self.shared.poke();
    }

    /// Read the state under the workflow lock.
    pub fn state<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        self.shared.read_state(f)
    }

    /// Mutate the state under the workflow lock, then poke.
    pub fn update<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let result = f(&mut self.shared.lock().state);
        self.shared.poke();
        result
    }

    /// Weighted progress of all steps, in `[0, 1]`.
    pub fn overall_progress(&self) -> f32 {
        self.shared.lock().overall_progress()
    }

    /// Number of declared steps.
    pub fn total_steps(&self) -> usize {
        self.shared.registry.len()
    }

    /// Whether poking schedules steps.
    pub fn is_enabled(&self) -> bool {
        self.shared.lock().enabled
    }

    /// Whether any step is running.
    pub fn is_running(&self) -> bool {
        self.shared.lock().any_running()
    }

    /// Whether every step completed.
    pub fn is_completed(&self) -> bool {
        self.shared.lock().all_completed()
    }

    /// Whether any step recorded errors.
    pub fn is_failed(&self) -> bool {
        self.shared.lock().any_failed()
    }

    /// All recorded errors, in step declaration order.
    pub fn errors(&self) -> Vec<StepError> {
        self.shared.lock().errors()
    }

    /// Aggregate status.
    pub fn status(&self) -> WorkflowStatus {
        self.shared.lock().status()
    }

    /// Scheduling status of the named step.
    pub fn step_status(&self, name: &str) -> Option<StepStatus> {
        let index = self.shared.registry.index_of(name)?;
        let core = self.shared.lock();
        Some(self.shared.status_of(&core, index))
    }

    /// Execution state of the named step.
    pub fn step_state(&self, name: &str) -> Option<StepState> {
        let index = self.shared.registry.index_of(name)?;
        Some(self.shared.lock().steps[index].state())
    }

    /// Own progress of the named step, in `[0, 1]`.
    pub fn step_progress(&self, name: &str) -> Option<f32> {
        let index = self.shared.registry.index_of(name)?;
        Some(self.shared.lock().steps[index].progress())
    }

    /// A consistent view of the whole workflow.
    pub fn snapshot(&self) -> WorkflowSnapshot {
        let core = self.shared.lock();
        let steps = self
            .shared
            .registry
            .steps()
            .iter()
            .zip(&core.steps)
            .enumerate()
            .map(|(index, (descriptor, step))| StepSnapshot {
                name: descriptor.name().to_string(),
                kind: descriptor.kind(),
                state: step.state(),
                status: self.shared.status_of(&core, index),
                progress: step.progress(),
                weight: step.normalized_weight(),
                errors: step.errors().to_vec(),
                started_at: step.started_at(),
                finished_at: step.finished_at(),
            })
            .collect();

        WorkflowSnapshot {
            name: self.name().to_string(),
            status: core.status(),
            enabled: core.enabled,
            running: core.any_running(),
            completed: core.all_completed(),
            failed: core.any_failed(),
            progress: core.overall_progress(),
            steps,
        }
    }

    /// Receive every event from now on.
    pub fn subscribe(&self) -> Receiver<WorkflowEvent> {
        let (tx, rx) = mpsc::channel();
        self.shared.lock().subscribers.add(tx);
        rx
    }

    /// Block until no step is running, or the timeout elapses.
    ///
    /// Returns whether the workflow is idle. Must not be called from a run
    /// function or with an inline dispatcher mid-step.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut core = self.shared.lock();
        while core.any_running() {
            if self.shared.idle.wait_until(&mut core.guard, deadline).timed_out() {
                return !core.any_running();
            }
        }
        true
    }
}

impl<S: Send + 'static> fmt::Debug for Workflow<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name())
            .field("status", &self.status())
            .field("progress", &self.overall_progress())
            .finish()
    }
}
