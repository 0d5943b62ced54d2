//! Integration tests for the registry public API.

use stepwise::registry::{Definition, DependencyGraph, RegistryBuilder, StepDef, StepRegistry};
use stepwise::{StepKind, StepwiseError};

#[derive(Default)]
struct Deploy {
    built: bool,
}

impl Definition for Deploy {
    fn steps(registry: RegistryBuilder<Self>) -> RegistryBuilder<Self> {
        registry
            .step(StepDef::new("build").weight(2.0).run_sync(|_| Ok(())))
            .step(
                StepDef::new("migrate")
                    .after(["build"])
                    .run_async(|token| {
                        token.complete_successfully();
                    }),
            )
            .step(
                StepDef::new("release")
                    .after(["build", "migrate"])
                    .ready_when(|s: &Deploy| s.built)
                    .weight(1.0)
                    .run_sync(|_| Ok(())),
            )
    }
}

#[test]
fn definition_registry_is_ordered_and_normalized() {
    let registry = StepRegistry::<Deploy>::of().unwrap();

    let names: Vec<&str> = registry.steps().iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["build", "migrate", "release"]);

    let weights: Vec<f32> = registry
        .steps()
        .iter()
        .map(|s| s.normalized_weight())
        .collect();
    assert_eq!(weights, vec![0.5, 0.25, 0.25]);

    assert_eq!(registry.get("migrate").unwrap().kind(), StepKind::Asynchronous);
    assert_eq!(registry.get("release").unwrap().predecessors(), &[0, 1]);
    assert_eq!(registry.index_of("release"), Some(2));
    assert!(registry.get("rollback").is_none());
}

#[test]
fn graph_reports_blocked_steps() {
    let registry = StepRegistry::<Deploy>::of().unwrap();
    let graph = registry.graph();

    assert_eq!(graph.blocked_by("build"), vec!["migrate", "release"]);
    assert_eq!(graph.blocked_by("migrate"), vec!["release"]);
    assert!(graph.blocked_by("release").is_empty());
}

#[test]
fn invalid_declarations_are_rejected() {
    let empty = StepRegistry::<()>::builder().build();
    assert!(matches!(empty, Err(StepwiseError::EmptyRegistry)));

    let duplicate = StepRegistry::<()>::builder()
        .step(StepDef::new("a").run_sync(|_| Ok(())))
        .step(StepDef::new("a").run_sync(|_| Ok(())))
        .build();
    assert!(matches!(duplicate, Err(StepwiseError::DuplicateStep { .. })));

    let no_body = StepRegistry::<()>::builder().step(StepDef::new("a")).build();
    assert!(matches!(
        no_body,
        Err(StepwiseError::MissingRunFunction { .. })
    ));

    let negative = StepRegistry::<()>::builder()
        .step(StepDef::new("a").weight(-1.0).run_sync(|_| Ok(())))
        .build();
    assert!(matches!(negative, Err(StepwiseError::InvalidWeight { .. })));

    let cycle = StepRegistry::<()>::builder()
        .step(StepDef::new("a").after(["b"]).run_sync(|_| Ok(())))
        .step(StepDef::new("b").after(["a"]).run_sync(|_| Ok(())))
        .build();
    assert!(matches!(
        cycle,
        Err(StepwiseError::CircularDependency { .. })
    ));
}

#[test]
fn standalone_dependency_graph() {
    let graph = DependencyGraph::builder()
        .add_step("fetch", vec![])
        .add_step("parse", vec!["fetch".to_string()])
        .add_step("index", vec!["parse".to_string()])
        .build()
        .unwrap();

    assert_eq!(graph.len(), 3);
    assert!(graph.find_cycle().is_none());
    let dependents = graph.transitive_dependents("fetch");
    assert!(dependents.contains("parse"));
    assert!(dependents.contains("index"));
}
