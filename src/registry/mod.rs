//! Step registries: the per-type table of declared steps.
//!
//! A registry is built once per workflow type from an explicit, ordered
//! list of [`StepDef`]s and is immutable afterwards:
//!
//! - [`StepRegistry`] - validated descriptors with normalized weights
//! - [`Definition`] - lets a state type declare its steps once, with the
//!   built registry cached process-wide
//! - [`DependencyGraph`] - structural checks over declared predecessors

pub mod dependency;
pub mod descriptor;

pub use dependency::{DependencyGraph, DependencyGraphBuilder};
pub use descriptor::{AsyncRun, Readiness, Runner, StepDef, StepDescriptor, StepKind, SyncRun};

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, StepwiseError};

/// Weight given to steps that do not declare one.
const DEFAULT_WEIGHT: f32 = 1.0;

/// Registries built through [`StepRegistry::of`], keyed by state type.
static REGISTRIES: LazyLock<Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// A state type that declares its own steps.
///
/// ```
/// use stepwise::registry::{Definition, RegistryBuilder, StepDef, StepRegistry};
///
/// #[derive(Default)]
/// struct Backup {
///     archived: bool,
/// }
///
/// impl Definition for Backup {
///     fn steps(registry: RegistryBuilder<Self>) -> RegistryBuilder<Self> {
///         registry
///             .step(StepDef::new("archive").run_sync(|_| Ok(())))
///             .step(StepDef::new("upload").after(["archive"]).run_sync(|_| Ok(())))
///     }
/// }
///
/// let registry = StepRegistry::<Backup>::of().unwrap();
/// assert_eq!(registry.len(), 2);
/// ```
pub trait Definition: Sized + Send + 'static {
    /// Declare the steps of this workflow type, in order.
    fn steps(registry: RegistryBuilder<Self>) -> RegistryBuilder<Self>;
}

/// The validated, ordered steps of one workflow type.
pub struct StepRegistry<S> {
    steps: Vec<StepDescriptor<S>>,
    graph: DependencyGraph,
}

impl<S> StepRegistry<S> {
    /// Start declaring a registry.
    pub fn builder() -> RegistryBuilder<S> {
        RegistryBuilder::new()
    }

    /// Descriptors in declaration order.
    pub fn steps(&self) -> &[StepDescriptor<S>] {
        &self.steps
    }

    /// Look up a descriptor by name.
    pub fn get(&self, name: &str) -> Option<&StepDescriptor<S>> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Position of a step in declaration order.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Declared predecessor relationships.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Number of declared steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the registry has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl<S: Definition> StepRegistry<S> {
    /// The registry for a workflow type, built on first use.
    ///
    /// Builds that fail are not cached, so every call reports the error.
    pub fn of() -> Result<Arc<Self>> {
        let key = TypeId::of::<S>();

        if let Some(cached) = REGISTRIES.lock().get(&key).cloned() {
            if let Ok(registry) = cached.downcast::<Self>() {
                return Ok(registry);
            }
        }

        // Build outside the lock: declarations may look up other registries
        let built: Arc<dyn Any + Send + Sync> =
            Arc::new(S::steps(RegistryBuilder::new()).build()?);
        let cached = Arc::clone(REGISTRIES.lock().entry(key).or_insert(built));

        cached.downcast::<Self>().map_err(|_| {
            StepwiseError::Other(anyhow::anyhow!(
                "registry cache holds the wrong type for {}",
                std::any::type_name::<S>()
            ))
        })
    }
}

impl<S> fmt::Debug for StepRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.steps)
            .finish()
    }
}

/// Collects step declarations and validates them into a [`StepRegistry`].
pub struct RegistryBuilder<S> {
    defs: Vec<StepDef<S>>,
}

impl<S> Default for RegistryBuilder<S> {
    fn default() -> Self {
        Self { defs: Vec::new() }
    }
}

impl<S> RegistryBuilder<S> {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step; declaration order is execution-scan order.
    pub fn step(mut self, def: StepDef<S>) -> Self {
        self.defs.push(def);
        self
    }

    /// Validate the declarations and normalize progress weights.
    ///
    /// Fails on an empty declaration list, empty or duplicate names, missing
    /// run functions, negative or non-finite weights, unknown predecessors
    /// and predecessor cycles.
    pub fn build(self) -> Result<StepRegistry<S>> {
        if self.defs.is_empty() {
            return Err(StepwiseError::EmptyRegistry);
        }

        let mut seen = HashSet::new();
        let mut graph = DependencyGraph::builder();
        for def in &self.defs {
            if def.name.is_empty() {
                return Err(StepwiseError::EmptyStepName);
            }
            if !seen.insert(def.name.as_str()) {
                return Err(StepwiseError::DuplicateStep {
                    name: def.name.clone(),
                });
            }
            if def.runner.is_none() {
                return Err(StepwiseError::MissingRunFunction {
                    step: def.name.clone(),
                });
            }
            if let Some(weight) = def.weight {
                if !weight.is_finite() || weight < 0.0 {
                    return Err(StepwiseError::InvalidWeight {
                        step: def.name.clone(),
                        weight,
                    });
                }
            }
            graph = graph.add_step(def.name.clone(), def.after.clone());
        }
        let graph = graph.build()?;

        let weights: Vec<f32> = self
            .defs
            .iter()
            .map(|d| d.weight.unwrap_or(DEFAULT_WEIGHT))
            .collect();
        let normalized = normalize_weights(&weights);

        let index: HashMap<&str, usize> = self
            .defs
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name.as_str(), i))
            .collect();
        let predecessors: Vec<Vec<usize>> = self
            .defs
            .iter()
            .map(|d| {
                let mut preds: Vec<usize> = d.after.iter().map(|n| index[n.as_str()]).collect();
                preds.sort_unstable();
                preds.dedup();
                preds
            })
            .collect();

        let mut steps = Vec::with_capacity(self.defs.len());
        for (((def, weight), normalized_weight), predecessors) in self
            .defs
            .into_iter()
            .zip(weights)
            .zip(normalized)
            .zip(predecessors)
        {
            let StepDef {
                name,
                readiness,
                runner,
                ..
            } = def;
            let runner = runner.ok_or_else(|| StepwiseError::MissingRunFunction {
                step: name.clone(),
            })?;
            steps.push(StepDescriptor {
                name,
                readiness,
                predecessors,
                runner,
                weight,
                normalized_weight,
            });
        }

        debug!(
            "Built step registry: {}",
            steps
                .iter()
                .map(|s| format!("{} ({}, {:.3})", s.name, s.kind(), s.normalized_weight))
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(StepRegistry { steps, graph })
    }
}

/// Scale weights so they sum to 1.
///
/// If every weight is zero, each step gets an equal share.
fn normalize_weights(weights: &[f32]) -> Vec<f32> {
    // Summed in f64: finite f32 weights cannot overflow it
    let total: f64 = weights.iter().map(|&w| f64::from(w)).sum();
    if total > 0.0 {
        weights
            .iter()
            .map(|&w| (f64::from(w) / total) as f32)
            .collect()
    } else {
        let share = 1.0 / weights.len() as f32;
        vec![share; weights.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Import;

    fn noop() -> StepDef<Import> {
        StepDef::new("noop").run_sync(|_| Ok(()))
    }

    fn sync_step(name: &str) -> StepDef<Import> {
        StepDef::new(name).run_sync(|_| Ok(()))
    }

    #[test]
    fn builds_in_declaration_order() {
        let registry = StepRegistry::builder()
            .step(sync_step("fetch"))
            .step(StepDef::new("parse").after(["fetch"]).run_async(|_| {}))
            .step(sync_step("index"))
            .build()
            .unwrap();

        let names: Vec<_> = registry.steps().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["fetch", "parse", "index"]);
        assert_eq!(registry.get("parse").unwrap().kind(), StepKind::Asynchronous);
        assert_eq!(registry.get("parse").unwrap().predecessors(), &[0]);
        assert_eq!(registry.index_of("index"), Some(2));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn default_weights_are_equal() {
        let registry = StepRegistry::builder()
            .step(sync_step("a"))
            .step(sync_step("b"))
            .step(sync_step("c"))
            .step(sync_step("d"))
            .build()
            .unwrap();

        for step in registry.steps() {
            assert!((step.normalized_weight() - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn weights_are_normalized() {
        let registry = StepRegistry::builder()
            .step(sync_step("small").weight(1.0))
            .step(sync_step("large").weight(3.0))
            .build()
            .unwrap();

        assert!((registry.get("small").unwrap().normalized_weight() - 0.25).abs() < 1e-6);
        assert!((registry.get("large").unwrap().normalized_weight() - 0.75).abs() < 1e-6);
        assert_eq!(registry.get("large").unwrap().weight(), 3.0);
    }

    #[test]
    fn normalized_weights_sum_to_one() {
        let registry = StepRegistry::builder()
            .step(sync_step("a").weight(0.3))
            .step(sync_step("b").weight(7.0))
            .step(sync_step("c"))
            .step(sync_step("d").weight(0.0))
            .build()
            .unwrap();

        let total: f32 = registry.steps().iter().map(|s| s.normalized_weight()).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert_eq!(registry.get("d").unwrap().normalized_weight(), 0.0);
    }

    #[test]
    fn huge_weights_still_sum_to_one() {
        let registry = StepRegistry::builder()
            .step(sync_step("a").weight(3.0e38))
            .step(sync_step("b").weight(3.0e38))
            .step(sync_step("c").weight(f32::MAX))
            .build()
            .unwrap();

        let total: f32 = registry.steps().iter().map(|s| s.normalized_weight()).sum();
        assert!((total - 1.0).abs() < 1e-5);
        for step in registry.steps() {
            assert!(step.normalized_weight() > 0.0);
        }
    }

    #[test]
    fn all_zero_weights_share_equally() {
        let registry = StepRegistry::builder()
            .step(sync_step("a").weight(0.0))
            .step(sync_step("b").weight(0.0))
            .build()
            .unwrap();

        for step in registry.steps() {
            assert!((step.normalized_weight() - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn empty_registry_fails() {
        let result = RegistryBuilder::<Import>::new().build();
        assert!(matches!(result, Err(StepwiseError::EmptyRegistry)));
    }

    #[test]
    fn duplicate_names_fail() {
        let result = StepRegistry::builder().step(noop()).step(noop()).build();
        match result {
            Err(StepwiseError::DuplicateStep { name }) => assert_eq!(name, "noop"),
            other => panic!("Expected DuplicateStep, got {:?}", other),
        }
    }

    #[test]
    fn empty_name_fails() {
        let result = StepRegistry::builder().step(sync_step("")).build();
        assert!(matches!(result, Err(StepwiseError::EmptyStepName)));
    }

    #[test]
    fn missing_run_function_fails() {
        let result = StepRegistry::<Import>::builder()
            .step(StepDef::new("declared"))
            .build();
        match result {
            Err(StepwiseError::MissingRunFunction { step }) => assert_eq!(step, "declared"),
            other => panic!("Expected MissingRunFunction, got {:?}", other),
        }
    }

    #[test]
    fn negative_weight_fails() {
        let result = StepRegistry::builder()
            .step(sync_step("a").weight(-1.0))
            .build();
        assert!(matches!(result, Err(StepwiseError::InvalidWeight { .. })));
    }

    #[test]
    fn nan_weight_fails() {
        let result = StepRegistry::builder()
            .step(sync_step("a").weight(f32::NAN))
            .build();
        assert!(matches!(result, Err(StepwiseError::InvalidWeight { .. })));
    }

    #[test]
    fn unknown_predecessor_fails() {
        let result = StepRegistry::builder()
            .step(sync_step("a").after(["ghost"]))
            .build();
        assert!(matches!(
            result,
            Err(StepwiseError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn predecessor_cycle_fails() {
        let result = StepRegistry::builder()
            .step(sync_step("a").after(["b"]))
            .step(sync_step("b").after(["a"]))
            .build();
        assert!(matches!(
            result,
            Err(StepwiseError::CircularDependency { .. })
        ));
    }

    #[test]
    fn graph_tracks_dependents() {
        let registry = StepRegistry::builder()
            .step(sync_step("a"))
            .step(sync_step("b").after(["a"]))
            .step(sync_step("c").after(["b"]))
            .build()
            .unwrap();

        assert_eq!(registry.graph().blocked_by("a"), vec!["b", "c"]);
    }

    struct Cached;

    impl Definition for Cached {
        fn steps(registry: RegistryBuilder<Self>) -> RegistryBuilder<Self> {
            registry
                .step(StepDef::new("one").run_sync(|_| Ok(())))
                .step(StepDef::new("two").weight(3.0).run_sync(|_| Ok(())))
        }
    }

    #[test]
    fn definition_registry_is_built_once() {
        let first = StepRegistry::<Cached>::of().unwrap();
        let second = StepRegistry::<Cached>::of().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 2);
    }

    struct Broken;

    impl Definition for Broken {
        fn steps(registry: RegistryBuilder<Self>) -> RegistryBuilder<Self> {
            registry.step(StepDef::new("dangling").after(["nowhere"]).run_sync(|_| Ok(())))
        }
    }

    #[test]
    fn definition_errors_are_reported_every_time() {
        assert!(StepRegistry::<Broken>::of().is_err());
        assert!(StepRegistry::<Broken>::of().is_err());
    }
}
