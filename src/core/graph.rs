//! Job dependency graph
//!
//! Edges run from a dependency to its dependents. The graph is validated on
//! construction: unknown names, self references and cycles are rejected.

use crate::core::error::{ConfigError, CycleError};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// Validated DAG over job names, in declaration order
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
    /// 0 for jobs without needs, otherwise 1 + the deepest dependency
    layer: Vec<usize>,
    layers: Vec<Vec<NodeIndex>>,
}

impl DependencyGraph {
    /// Build the graph from `(name, needs)` pairs in declaration order
    pub fn build<'a, I>(jobs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let jobs: Vec<(&str, &[String])> = jobs.into_iter().collect();

        let mut graph = DiGraph::with_capacity(jobs.len(), jobs.len());
        let mut indices = HashMap::with_capacity(jobs.len());
        for (name, _) in &jobs {
            let node = graph.add_node(name.to_string());
            if indices.insert(name.to_string(), node).is_some() {
                return Err(ConfigError::DuplicateJob(name.to_string()));
            }
        }

        for (name, needs) in &jobs {
            let node = indices[*name];
            for dep in needs.iter() {
                if dep == name {
                    return Err(ConfigError::SelfDependency(name.to_string()));
                }
                let &d = indices
                    .get(dep)
                    .ok_or_else(|| ConfigError::UnknownDependency {
                        job: name.to_string(),
                        dependency: dep.clone(),
                    })?;
                graph.update_edge(d, node, ());
            }
        }

        let order = toposort(&graph, None).map_err(|_| Self::find_cycle(&graph))?;

        let mut layer = vec![0; graph.node_count()];
        for &node in &order {
            layer[node.index()] = graph
                .neighbors_directed(node, Direction::Incoming)
                .map(|d| layer[d.index()] + 1)
                .max()
                .unwrap_or(0);
        }

        let depth = layer.iter().map(|l| l + 1).max().unwrap_or(0);
        let mut layers = vec![Vec::new(); depth];
        for node in graph.node_indices() {
            layers[layer[node.index()]].push(node);
        }

        Ok(Self {
            graph,
            indices,
            layer,
            layers,
        })
    }

    /// Name one cycle, starting and ending with the same job.
    ///
    /// Picks the strongly connected component holding the earliest declared
    /// job and walks `needs` edges inside it until a job repeats.
    fn find_cycle(graph: &DiGraph<String, ()>) -> CycleError {
        let Some(component) = tarjan_scc(graph)
            .into_iter()
            .filter(|c| c.len() > 1)
            .min_by_key(|c| c.iter().min().copied())
        else {
            return CycleError { cycle: Vec::new() };
        };
        let members: HashSet<NodeIndex> = component.iter().copied().collect();

        let mut path: Vec<NodeIndex> = Vec::new();
        let mut current = component.iter().min().copied();
        while let Some(node) = current {
            if let Some(start) = path.iter().position(|&n| n == node) {
                path.drain(..start);
                path.push(node);
                break;
            }
            path.push(node);
            current = graph
                .neighbors_directed(node, Direction::Incoming)
                .filter(|n| members.contains(n))
                .min();
        }

        CycleError {
            cycle: path.into_iter().map(|n| graph[n].clone()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.indices.get(name).map(|n| n.index())
    }

    pub fn layer_of(&self, name: &str) -> Option<usize> {
        self.index_of(name).map(|i| self.layer[i])
    }

    /// Job names grouped by layer, declaration order within a layer
    pub fn layers(&self) -> Vec<Vec<&str>> {
        self.layers
            .iter()
            .map(|layer| layer.iter().map(|&n| self.graph[n].as_str()).collect())
            .collect()
    }

    /// Names of the direct dependencies of `name`, in declaration order
    pub fn needs_of(&self, name: &str) -> Vec<&str> {
        let Some(&node) = self.indices.get(name) else {
            return Vec::new();
        };
        let mut needs: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .collect();
        needs.sort();
        needs.into_iter().map(|n| self.graph[n].as_str()).collect()
    }

    /// All jobs, layer by layer
    pub fn topological_order(&self) -> Vec<&str> {
        self.layers().into_iter().flatten().collect()
    }
}
