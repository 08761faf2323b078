use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use crate::{DependencyGraph, DependencyNode};

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("build topology cannot progress; unresolved nodes: {}", .0.join(", "))]
    CycleDetected(Vec<String>),
}

/// A ready/done scheduler over the build-predecessor relation.
///
/// A node's build predecessors are its build-system/backend/sdist children
/// plus the install closure of each such child: everything that must exist
/// as a wheel before the node's build environment can be assembled.
#[derive(Debug)]
pub struct BuildTopology {
    /// Remaining predecessors per node key.
    pending: HashMap<String, HashSet<String>>,
    /// Reverse map: node key -> the nodes waiting on it.
    dependents: HashMap<String, Vec<String>>,
    ready: Vec<String>,
    in_flight: HashSet<String>,
    /// Nodes that must build alone: nothing else starts while one is in
    /// flight, and one does not start until in-flight builds drain.
    exclusive: HashSet<String>,
}

impl BuildTopology {
    /// Build the topology for every non-root node of the graph, failing on
    /// a build-level cycle.
    pub fn new(graph: &DependencyGraph) -> Result<Self, TopologyError> {
        let mut pending: HashMap<String, HashSet<String>> = HashMap::new();
        for node in graph.get_all_nodes() {
            if node.is_root() {
                continue;
            }
            pending.insert(node.key.clone(), build_predecessors(graph, node));
        }

        // Cycle check over the predecessor relation.
        let mut petgraph: DiGraph<&str, ()> = DiGraph::new();
        let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
        for key in pending.keys() {
            indices.insert(key.as_str(), petgraph.add_node(key.as_str()));
        }
        for (key, predecessors) in &pending {
            for predecessor in predecessors {
                if let (Some(&from), Some(&to)) =
                    (indices.get(predecessor.as_str()), indices.get(key.as_str()))
                {
                    petgraph.add_edge(from, to, ());
                }
            }
        }
        if toposort(&petgraph, None).is_err() {
            let mut unresolved: Vec<String> = pending
                .iter()
                .filter(|(_, predecessors)| !predecessors.is_empty())
                .map(|(key, _)| key.clone())
                .collect();
            unresolved.sort();
            return Err(TopologyError::CycleDetected(unresolved));
        }

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for (key, predecessors) in &pending {
            for predecessor in predecessors {
                dependents
                    .entry(predecessor.clone())
                    .or_default()
                    .push(key.clone());
            }
        }

        let mut ready: Vec<String> = pending
            .iter()
            .filter(|(_, predecessors)| predecessors.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        ready.sort();
        pending.retain(|_, predecessors| !predecessors.is_empty());

        Ok(Self {
            pending,
            dependents,
            ready,
            in_flight: HashSet::new(),
            exclusive: HashSet::new(),
        })
    }

    /// Mark nodes whose builds must not overlap with any other build.
    pub fn set_exclusive(&mut self, keys: impl IntoIterator<Item = String>) {
        self.exclusive.extend(keys);
    }

    /// Whether any work remains, ready or blocked.
    pub fn is_active(&self) -> bool {
        !self.ready.is_empty() || !self.pending.is_empty() || !self.in_flight.is_empty()
    }

    /// Nodes whose predecessors have all completed, name-ascending. Each is
    /// handed out once.
    ///
    /// Exclusive nodes gate the flow: while one is in flight nothing else
    /// starts, and one starts only when the scheduler is idle (alone, the
    /// lowest-named first).
    pub fn take_ready(&mut self) -> Vec<String> {
        if self.in_flight.iter().any(|key| self.exclusive.contains(key)) {
            return Vec::new();
        }
        self.ready.sort();
        if self.in_flight.is_empty() {
            if let Some(position) = self
                .ready
                .iter()
                .position(|key| self.exclusive.contains(key))
            {
                let key = self.ready.remove(position);
                self.in_flight.insert(key.clone());
                return vec![key];
            }
        }
        let mut dispatched = Vec::new();
        let mut held = Vec::new();
        for key in std::mem::take(&mut self.ready) {
            if self.exclusive.contains(&key) {
                held.push(key);
            } else {
                dispatched.push(key);
            }
        }
        self.ready = held;
        self.in_flight.extend(dispatched.iter().cloned());
        dispatched
    }

    /// Mark a node's build complete, unblocking its dependents.
    pub fn done(&mut self, key: &str) {
        self.in_flight.remove(key);
        let Some(dependents) = self.dependents.remove(key) else {
            return;
        };
        for dependent in dependents {
            if let Some(predecessors) = self.pending.get_mut(&dependent) {
                predecessors.remove(key);
                if predecessors.is_empty() {
                    self.pending.remove(&dependent);
                    self.ready.push(dependent);
                }
            }
        }
        self.ready.sort();
    }
}

/// The build-system/backend/sdist children of `node` plus the install
/// closure of each such child.
fn build_predecessors(graph: &DependencyGraph, node: &DependencyNode) -> HashSet<String> {
    let mut predecessors = HashSet::new();
    for edge in &node.children {
        if !edge.kind.is_build_requirement() {
            continue;
        }
        if predecessors.insert(edge.key.clone()) {
            install_closure(graph, &edge.key, &mut predecessors);
        }
    }
    predecessors
}

fn install_closure(graph: &DependencyGraph, key: &str, acc: &mut HashSet<String>) {
    let Some(node) = graph.get_node(key) else {
        return;
    };
    for edge in &node.children {
        if !edge.kind.is_install_requirement() {
            continue;
        }
        if acc.insert(edge.key.clone()) {
            install_closure(graph, &edge.key, acc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RequirementKind;
    use fromager_normalize::PackageName;
    use fromager_pep440::Version;
    use fromager_pep508::Requirement;
    use std::str::FromStr;

    fn name(s: &str) -> PackageName {
        PackageName::new(s).unwrap()
    }

    fn version(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn req(s: &str) -> Requirement {
        Requirement::from_str(s).unwrap()
    }

    /// a needs setuptools (build-system); setuptools needs wheelutil
    /// (install); b has no build deps.
    fn graph() -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        graph
            .add_dependency(None, None, RequirementKind::TopLevel, &req("a"), &version("1"), "", false)
            .unwrap();
        graph
            .add_dependency(None, None, RequirementKind::TopLevel, &req("b"), &version("1"), "", false)
            .unwrap();
        graph
            .add_dependency(
                Some(&name("a")),
                Some(&version("1")),
                RequirementKind::BuildSystem,
                &req("setuptools"),
                &version("70.0"),
                "",
                false,
            )
            .unwrap();
        graph
            .add_dependency(
                Some(&name("setuptools")),
                Some(&version("70.0")),
                RequirementKind::Install,
                &req("wheelutil"),
                &version("0.4"),
                "",
                false,
            )
            .unwrap();
        graph
    }

    #[test]
    fn ready_then_unblock() {
        let mut topology = BuildTopology::new(&graph()).unwrap();
        // Everything without build deps is ready immediately, sorted by key.
        let ready = topology.take_ready();
        assert_eq!(ready, vec!["b==1", "setuptools==70.0", "wheelutil==0.4"]);
        assert!(topology.is_active());
        // `a` needs setuptools and its install closure.
        topology.done("b==1");
        assert!(topology.take_ready().is_empty());
        topology.done("setuptools==70.0");
        assert!(topology.take_ready().is_empty());
        topology.done("wheelutil==0.4");
        assert_eq!(topology.take_ready(), vec!["a==1"]);
        topology.done("a==1");
        assert!(!topology.is_active());
    }

    #[test]
    fn exclusive_nodes_run_alone() {
        let mut topology = BuildTopology::new(&graph()).unwrap();
        topology.set_exclusive(["setuptools==70.0".to_string()]);

        // Idle scheduler with an exclusive node ready: it goes out alone.
        let first = topology.take_ready();
        assert_eq!(first, vec!["setuptools==70.0"]);
        // Nothing else starts while it is in flight.
        assert!(topology.take_ready().is_empty());
        topology.done("setuptools==70.0");

        let rest = topology.take_ready();
        assert_eq!(rest, vec!["b==1", "wheelutil==0.4"]);
        topology.done("b==1");
        topology.done("wheelutil==0.4");
        assert_eq!(topology.take_ready(), vec!["a==1"]);
    }

    #[test]
    fn build_cycle_detected() {
        let mut g = DependencyGraph::new();
        g.add_dependency(None, None, RequirementKind::TopLevel, &req("x"), &version("1"), "", false)
            .unwrap();
        g.add_dependency(
            Some(&name("x")),
            Some(&version("1")),
            RequirementKind::BuildSystem,
            &req("y"),
            &version("1"),
            "",
            false,
        )
        .unwrap();
        g.add_dependency(
            Some(&name("y")),
            Some(&version("1")),
            RequirementKind::BuildSystem,
            &req("x"),
            &version("1"),
            "",
            false,
        )
        .unwrap();
        assert!(matches!(
            BuildTopology::new(&g),
            Err(TopologyError::CycleDetected(_))
        ));
    }
}
