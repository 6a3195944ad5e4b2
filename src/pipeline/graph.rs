//! Dependency graph and acyclicity checks for pipeline jobs, on petgraph.

use std::collections::{BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{FerrymanError, Result};

use super::job::Job;

/// Jobs as graph nodes; an edge runs from a dependency to its dependent.
///
/// Node indices follow insertion order, which makes ready sets and the
/// topological order deterministic.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index_map: HashMap<String, NodeIndex>,
    depends_on: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Builds the graph, rejecting duplicate ids, unknown dependencies and cycles.
    pub fn build(jobs: &[Job]) -> Result<Self> {
        Self::from_nodes(jobs.iter().map(|job| (job.id.clone(), job.depends_on.clone())))
    }

    /// Builds a graph from `(id, dependencies)` pairs in declared order.
    pub(crate) fn from_nodes<I>(nodes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, BTreeSet<String>)>,
    {
        let nodes: Vec<(String, BTreeSet<String>)> = nodes.into_iter().collect();
        let mut graph = Self::default();
        for (id, deps) in &nodes {
            if graph.index_map.contains_key(id) {
                return Err(FerrymanError::Config(format!("duplicate id '{id}'")));
            }
            let idx = graph.graph.add_node(id.clone());
            graph.index_map.insert(id.clone(), idx);
            graph.depends_on.insert(id.clone(), deps.clone());
        }
        for (id, deps) in &nodes {
            let to = graph.index_map[id.as_str()];
            for dep in deps {
                let Some(&from) = graph.index_map.get(dep) else {
                    return Err(FerrymanError::UnknownDependency {
                        job: id.clone(),
                        dependency: dep.clone(),
                    });
                };
                graph.graph.add_edge(from, to, ());
            }
        }
        toposort(&graph.graph, None).map_err(|cycle| graph.cycle_error(cycle.node_id()))?;
        Ok(graph)
    }

    /// Kahn's algorithm over the graph, preferring the earliest declared
    /// node among those ready. Fails with [`FerrymanError::CycleDetected`]
    /// naming every job on a cycle.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
            .collect();
        let mut ready: BTreeSet<NodeIndex> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(idx, _)| *idx)
            .collect();
        let mut sorted = Vec::with_capacity(self.graph.node_count());

        while let Some(idx) = ready.pop_first() {
            sorted.push(idx);
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(next);
                    }
                }
            }
        }

        if sorted.len() != self.graph.node_count() {
            let stuck = self
                .graph
                .node_indices()
                .find(|idx| !sorted.contains(idx))
                .unwrap_or_default();
            return Err(self.cycle_error(stuck));
        }
        Ok(sorted.into_iter().map(|idx| self.graph[idx].clone()).collect())
    }

    /// Names every node of a non-trivial strongly connected component or
    /// self-loop; falls back to `start`, the node petgraph tripped on.
    fn cycle_error(&self, start: NodeIndex) -> FerrymanError {
        let mut jobs: Vec<String> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .flatten()
            .map(|idx| self.graph[idx].clone())
            .collect();
        if jobs.is_empty()
            && let Some(id) = self.graph.node_weight(start)
        {
            jobs.push(id.clone());
        }
        jobs.sort();
        FerrymanError::CycleDetected { jobs }
    }

    /// Jobs with no dependencies, in insertion order.
    pub fn roots(&self) -> Vec<String> {
        self.graph
            .node_indices()
            .filter(|idx| {
                self.graph
                    .neighbors_directed(*idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|idx| self.graph[idx].clone())
            .collect()
    }

    pub fn dependencies(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.depends_on.get(id)
    }

    /// Jobs that depend on `id`, in insertion order.
    pub fn dependents(&self, id: &str) -> Vec<String> {
        let Some(&idx) = self.index_map.get(id) else {
            return Vec::new();
        };
        let mut next: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        next.sort();
        next.into_iter().map(|n| self.graph[n].clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::JobType;

    fn job(id: &str, deps: &[&str]) -> Job {
        deps.iter().fold(
            Job::new(id, JobType::Upload).with_id(id),
            |job, dep| job.depends_on(*dep),
        )
    }

    #[test]
    fn diamond_orders_roots_first() {
        let jobs = vec![
            job("a", &[]),
            job("b", &["a"]),
            job("c", &["a"]),
            job("d", &["b", "c"]),
        ];
        let graph = DependencyGraph::build(&jobs).unwrap();
        assert_eq!(graph.roots(), vec!["a"]);
        let order = graph.topological_order().unwrap();
        assert_eq!(order.first().map(String::as_str), Some("a"));
        assert_eq!(order.last().map(String::as_str), Some("d"));
        assert_eq!(graph.dependents("a"), ["b", "c"]);
    }

    #[test]
    fn independent_jobs_are_all_roots() {
        let jobs = vec![job("x", &[]), job("y", &[]), job("z", &[])];
        let graph = DependencyGraph::build(&jobs).unwrap();
        assert_eq!(graph.roots(), vec!["x", "y", "z"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let jobs = vec![
            job("a", &[]),
            job("b", &["a", "d"]),
            job("c", &["b"]),
            job("d", &["c"]),
        ];
        match DependencyGraph::build(&jobs) {
            Err(FerrymanError::CycleDetected { jobs }) => {
                assert_eq!(jobs, vec!["b", "c", "d"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let jobs = vec![job("a", &["a"])];
        assert!(matches!(
            DependencyGraph::build(&jobs),
            Err(FerrymanError::CycleDetected { .. })
        ));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let jobs = vec![job("a", &["ghost"])];
        assert!(matches!(
            DependencyGraph::build(&jobs),
            Err(FerrymanError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let jobs = vec![job("a", &[]), job("a", &[])];
        assert!(matches!(
            DependencyGraph::build(&jobs),
            Err(FerrymanError::Config(_))
        ));
    }

    #[test]
    fn ready_ties_prefer_declared_order() {
        let jobs = vec![
            job("late", &["root"]),
            job("root", &[]),
            job("early", &["root"]),
            job("tail", &["early", "late"]),
        ];
        let graph = DependencyGraph::build(&jobs).unwrap();
        assert_eq!(graph.topological_order().unwrap(), ["root", "late", "early", "tail"]);
        assert_eq!(graph.dependencies("tail").map(BTreeSet::len), Some(2));
        assert_eq!(graph.dependents("root"), ["late", "early"]);
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn jobs_downstream_of_a_cycle_are_not_blamed() {
        let jobs = vec![job("a", &["b"]), job("b", &["a"]), job("c", &["b"])];
        match DependencyGraph::build(&jobs) {
            Err(FerrymanError::CycleDetected { jobs }) => assert_eq!(jobs, ["a", "b"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }
}
