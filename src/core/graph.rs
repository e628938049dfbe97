//! Dependency graph for workflow steps.
//!
//! Nodes are step (or phase) identifiers; each node maps to the set of nodes
//! it depends on. The graph produces a topological order and execution
//! levels, where every node in a level can run concurrently once all
//! previous levels have resolved.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use thiserror::Error;

/// Errors raised while ordering a dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Kahn's algorithm could not order every node.
    #[error("Cycle detected in dependency graph ({ordered} of {total} nodes ordered)")]
    CycleDetected { ordered: usize, total: usize },

    /// Level computation stalled with nodes still unscheduled.
    #[error("Dependency graph has cycles or unreachable nodes: {}", remaining.join(", "))]
    Unresolvable { remaining: Vec<String> },
}

impl GraphError {
    /// Both variants describe a graph that cannot be executed.
    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::CycleDetected { .. } | Self::Unresolvable { .. })
    }
}

/// Directed graph of named nodes with dependency edges.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// All node identifiers, in insertion order
    nodes: Vec<String>,
    /// Fast membership lookup for `nodes`
    index: HashSet<String>,
    /// node -> nodes it depends on
    dependencies: HashMap<String, HashSet<String>>,
    /// node -> nodes that depend on it
    dependents: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Adding an existing node is a no-op.
    pub fn add_node(&mut self, id: impl Into<String>) {
        let id = id.into();
        if self.index.insert(id.clone()) {
            self.nodes.push(id);
        }
    }

    /// Record that `node` depends on `depends_on`. Both are added as nodes.
    ///
    /// Self-loops are accepted here and reported as a cycle when ordering.
    pub fn add_edge(&mut self, node: impl Into<String>, depends_on: impl Into<String>) {
        let node = node.into();
        let depends_on = depends_on.into();
        self.add_node(node.clone());
        self.add_node(depends_on.clone());
        self.dependencies.entry(node.clone()).or_default().insert(depends_on.clone());
        self.dependents.entry(depends_on).or_default().insert(node);
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `id` is a node.
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    /// Node identifiers in insertion order.
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Direct dependencies of `id`.
    pub fn dependencies(&self, id: &str) -> HashSet<&str> {
        self.dependencies
            .get(id)
            .map(|deps| deps.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Nodes that directly depend on `id`.
    pub fn dependents(&self, id: &str) -> HashSet<&str> {
        self.dependents
            .get(id)
            .map(|deps| deps.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Nodes not yet completed whose dependencies are all in `completed`.
    pub fn ready_nodes(&self, completed: &HashSet<String>) -> BTreeSet<String> {
        self.nodes
            .iter()
            .filter(|node| !completed.contains(*node))
            .filter(|node| {
                self.dependencies
                    .get(*node)
                    .map_or(true, |deps| deps.iter().all(|dep| completed.contains(dep)))
            })
            .cloned()
            .collect()
    }

    /// Topological order using Kahn's algorithm.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|node| (node.as_str(), self.dependencies.get(node).map_or(0, HashSet::len)))
            .collect();

        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .map(String::as_str)
            .filter(|node| in_degree.get(node).copied() == Some(0))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = queue.pop_front() {
            order.push(node.to_string());

            let Some(dependents) = self.dependents.get(node) else {
                continue;
            };
            // Sorted so the order is deterministic for a given graph
            let mut dependents: Vec<&str> = dependents.iter().map(String::as_str).collect();
            dependents.sort_unstable();

            for dependent in dependents {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if order.len() < self.nodes.len() {
            return Err(GraphError::CycleDetected {
                ordered: order.len(),
                total: self.nodes.len(),
            });
        }

        Ok(order)
    }

    /// Group nodes into execution levels.
    ///
    /// Level `n` holds every node whose dependencies are all covered by
    /// levels `0..n`.
    pub fn execution_levels(&self) -> Result<Vec<BTreeSet<String>>, GraphError> {
        let mut levels = Vec::new();
        let mut completed: HashSet<String> = HashSet::with_capacity(self.nodes.len());

        while completed.len() < self.nodes.len() {
            let ready = self.ready_nodes(&completed);
            if ready.is_empty() {
                let remaining = self
                    .nodes
                    .iter()
                    .filter(|node| !completed.contains(*node))
                    .cloned()
                    .collect();
                return Err(GraphError::Unresolvable { remaining });
            }

            completed.extend(ready.iter().cloned());
            levels.push(ready);
        }

        Ok(levels)
    }

    /// Check the graph can be ordered.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.topological_order().map(|_| ())
    }
}
