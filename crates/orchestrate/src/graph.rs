//! Dependency graph - a validated DAG of steps
//!
//! Construction validates ids and edges and rejects cycles before
//! anything runs. Readiness is recomputed from live execution state on
//! every transition; no cached order is reused once a failure prunes the
//! graph.

use crate::error::GraphError;
use crate::state::RunState;
use crate::step::BoxedStep;
use std::collections::HashMap;

/// A validated, acyclic graph of steps.
///
/// Step indices are stable for the lifetime of the graph and are the
/// keys used by [`RunState`].
pub struct Graph {
    steps: Vec<BoxedStep>,
    /// deps[i] = indices that step i depends on
    deps: Vec<Vec<usize>>,
    /// One valid topological order, used as the dispatch tie-break so
    /// same-target steps run in dependency order
    topo: Vec<usize>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("steps", &self.steps.iter().map(|s| s.id()).collect::<Vec<_>>())
            .field("deps", &self.deps)
            .field("topo", &self.topo)
            .field("index", &self.index)
            .finish()
    }
}

impl Graph {
    /// Build a graph from steps, validating unique ids, dependency
    /// references, and acyclicity.
    pub fn build(steps: Vec<BoxedStep>) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.id(), i).is_some() {
                return Err(GraphError::DuplicateId(step.id()));
            }
        }

        let mut deps: Vec<Vec<usize>> = Vec::with_capacity(steps.len());
        for step in &steps {
            let mut step_deps = Vec::new();
            for dep in step.depends_on() {
                match index.get(&dep) {
                    Some(&di) => step_deps.push(di),
                    None => {
                        return Err(GraphError::UnknownDependency {
                            step: step.id(),
                            dependency: dep,
                        });
                    }
                }
            }
            deps.push(step_deps);
        }

        let topo = topological_order(&steps, &deps)?;

        Ok(Self {
            steps,
            deps,
            topo,
            index,
        })
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the graph has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The step at `idx`
    pub fn step(&self, idx: usize) -> &dyn crate::step::Step {
        self.steps[idx].as_ref()
    }

    /// Look up a step index by id
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Steps whose dependencies are all satisfied and whose own status
    /// is `Pending`, in topological order.
    ///
    /// Pure given the current execution state; recomputed after every
    /// transition.
    pub fn ready(&self, state: &RunState) -> Vec<usize> {
        self.topo
            .iter()
            .copied()
            .filter(|&i| {
                state.status(i) == crate::state::StepStatus::Pending
                    && self.deps[i]
                        .iter()
                        .all(|&d| state.status(d).satisfies_dependents())
            })
            .collect()
    }
}

/// Kahn's algorithm; on leftover nodes, names one cycle for the error.
fn topological_order(
    steps: &[BoxedStep],
    deps: &[Vec<usize>],
) -> Result<Vec<usize>, GraphError> {
    let n = steps.len();
    let mut indegree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, step_deps) in deps.iter().enumerate() {
        indegree[i] = step_deps.len();
        for &d in step_deps {
            dependents[d].push(i);
        }
    }

    let mut queue: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = queue.pop() {
        order.push(i);
        for &dep in &dependents[i] {
            indegree[dep] -= 1;
            if indegree[dep] == 0 {
                queue.push(dep);
            }
        }
    }

    if order.len() < n {
        // Nodes with remaining indegree sit on (or feed into) a cycle;
        // every such node has at least one dependency that is also stuck.
        let stuck: Vec<bool> = (0..n).map(|i| indegree[i] > 0).collect();
        let start = (0..n).find(|&i| stuck[i]).unwrap_or(0);
        return Err(GraphError::Cycle(describe_cycle(steps, deps, &stuck, start)));
    }

    Ok(order)
}

/// Walk dependency edges among stuck nodes from `start` until a node
/// repeats, then format the loop as `a -> b -> a`.
fn describe_cycle(
    steps: &[BoxedStep],
    deps: &[Vec<usize>],
    stuck: &[bool],
    start: usize,
) -> String {
    let mut seen = Vec::new();
    let mut current = start;
    loop {
        if let Some(pos) = seen.iter().position(|&s| s == current) {
            let mut names: Vec<String> =
                seen[pos..].iter().map(|&i: &usize| steps[i].id()).collect();
            names.push(steps[current].id());
            return names.join(" -> ");
        }
        seen.push(current);
        match deps[current].iter().find(|&&d| stuck[d]) {
            Some(&next) => current = next,
            None => return steps[current].id(),
        }
    }
}
