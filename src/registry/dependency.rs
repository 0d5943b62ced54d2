//! Dependency graph over declared step predecessors.
//!
//! Only validates and answers structural questions; runtime readiness is
//! evaluated by the engine against live step state.

use std::collections::{HashMap, HashSet};

use crate::error::{Result, StepwiseError};

/// Represents the declared predecessor relationships between steps.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Step names in declaration order.
    order: Vec<String>,
    /// Map of step name to its direct predecessors.
    dependencies: HashMap<String, Vec<String>>,
    /// Map of step name to steps that depend on it.
    dependents: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    /// Create a new dependency graph builder.
    pub fn builder() -> DependencyGraphBuilder {
        DependencyGraphBuilder::new()
    }

    /// Get the direct predecessors of a step.
    pub fn dependencies_of(&self, step: &str) -> Option<&[String]> {
        self.dependencies.get(step).map(Vec::as_slice)
    }

    /// Get steps that depend on the given step.
    pub fn dependents_of(&self, step: &str) -> Option<&HashSet<String>> {
        self.dependents.get(step)
    }

    /// Check if a step exists in the graph.
    pub fn contains(&self, step: &str) -> bool {
        self.dependencies.contains_key(step)
    }

    /// Get the number of steps in the graph.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Find a cycle in the graph, returning the path if one exists.
    ///
    /// Steps are visited in declaration order so the reported path is stable.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum State {
            Unvisited,
            Visiting,
            Visited,
        }

        fn dfs<'a>(
            node: &'a str,
            graph: &'a DependencyGraph,
            state: &mut HashMap<&'a str, State>,
            path: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            state.insert(node, State::Visiting);
            path.push(node);

            for dep in graph.dependencies.get(node).into_iter().flatten() {
                match state.get(dep.as_str()) {
                    Some(State::Visiting) => {
                        let start = path.iter().position(|s| *s == dep.as_str())?;
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|s| s.to_string()).collect();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Some(State::Unvisited) | None => {
                        if let Some(cycle) = dfs(dep, graph, state, path) {
                            return Some(cycle);
                        }
                    }
                    Some(State::Visited) => {}
                }
            }

            path.pop();
            state.insert(node, State::Visited);
            None
        }

        let mut state: HashMap<&str, State> = self
            .order
            .iter()
            .map(|s| (s.as_str(), State::Unvisited))
            .collect();
        let mut path = Vec::new();

        for step in &self.order {
            if state.get(step.as_str()) == Some(&State::Unvisited) {
                if let Some(cycle) = dfs(step, self, &mut state, &mut path) {
                    return Some(cycle);
                }
            }
        }

        None
    }

    /// Get all transitive dependents of a step.
    ///
    /// Returns steps that depend on the given step, directly or indirectly.
    pub fn transitive_dependents(&self, step: &str) -> HashSet<String> {
        let mut result = HashSet::new();
        let mut to_visit = vec![step.to_string()];

        while let Some(current) = to_visit.pop() {
            if let Some(dependents) = self.dependents.get(&current) {
                for dep in dependents {
                    if result.insert(dep.clone()) {
                        to_visit.push(dep.clone());
                    }
                }
            }
        }

        result
    }

    /// Transitive dependents of a step, in declaration order.
    pub fn blocked_by(&self, step: &str) -> Vec<String> {
        let dependents = self.transitive_dependents(step);
        self.order
            .iter()
            .filter(|s| dependents.contains(*s))
            .cloned()
            .collect()
    }
}

/// Builder for constructing a DependencyGraph.
#[derive(Debug, Default)]
pub struct DependencyGraphBuilder {
    order: Vec<String>,
    dependencies: HashMap<String, Vec<String>>,
}

impl DependencyGraphBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step with its predecessors.
    pub fn add_step(mut self, name: impl Into<String>, depends_on: Vec<String>) -> Self {
        let name = name.into();
        if !self.dependencies.contains_key(&name) {
            self.order.push(name.clone());
        }
        let deps = self.dependencies.entry(name).or_default();
        for dep in depends_on {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        self
    }

    /// Build the dependency graph.
    ///
    /// Returns an error if any predecessor references a non-existent step
    /// or if the predecessors form a cycle.
    pub fn build(self) -> Result<DependencyGraph> {
        for step in &self.order {
            for dep in &self.dependencies[step] {
                if !self.dependencies.contains_key(dep) {
                    return Err(StepwiseError::UnknownDependency {
                        step: step.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Build dependents map (reverse lookup)
        let mut dependents: HashMap<String, HashSet<String>> = self
            .order
            .iter()
            .map(|s| (s.clone(), HashSet::new()))
            .collect();

        for (step, deps) in &self.dependencies {
            for dep in deps {
                if let Some(set) = dependents.get_mut(dep) {
                    set.insert(step.clone());
                }
            }
        }

        let graph = DependencyGraph {
            order: self.order,
            dependencies: self.dependencies,
            dependents,
        };

        if let Some(cycle) = graph.find_cycle() {
            return Err(StepwiseError::CircularDependency {
                cycle: cycle.join(" -> "),
            });
        }

        Ok(graph)
    }
}
