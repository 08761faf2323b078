use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use fromager_normalize::PackageName;
use fromager_pep440::Version;
use fromager_pep508::Requirement;

use crate::RequirementKind;

/// The key of the sentinel root node, which stands for the union of
/// top-level requirements.
pub const ROOT: &str = "";

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("trying to add {node} to parent {parent} but {parent:?} does not exist")]
    MissingParent { parent: String, node: String },

    #[error("graph refers to missing node {0:?}")]
    MissingNode(String),

    #[error("invalid requirement `{0}` in graph: {1}")]
    InvalidRequirement(String, String),

    #[error("invalid version `{0}` in graph: {1}")]
    InvalidVersion(String, String),

    #[error("invalid requirement kind in graph: {0}")]
    InvalidKind(String),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One direction of a recorded dependency. Edges are duplicated on both
/// endpoints; `key` names the node at the other end, so the graph stays a
/// flat map without owning cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub kind: RequirementKind,
    pub req: Requirement,
    pub key: String,
}

/// A `name==version` node. Write-once fields; edge lists are append-only.
#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub key: String,
    /// Canonicalized name; empty for the root sentinel.
    pub canonicalized_name: String,
    pub version: Version,
    pub download_url: String,
    pub pre_built: bool,
    /// Outgoing edges; `key` is the child.
    pub children: Vec<DependencyEdge>,
    /// Incoming edges; `key` is the parent.
    pub parents: Vec<DependencyEdge>,
}

impl DependencyNode {
    fn new(name: &str, version: Version, download_url: String, pre_built: bool) -> Self {
        let key = if name.is_empty() {
            ROOT.to_string()
        } else {
            format!("{name}=={version}")
        };
        Self {
            key,
            canonicalized_name: name.to_string(),
            version,
            download_url,
            pre_built,
            children: Vec::new(),
            parents: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.key == ROOT
    }

    /// Incoming edges of kind `install`, the ones the constraints writer
    /// arbitrates between.
    pub fn get_incoming_install_edges(&self) -> Vec<&DependencyEdge> {
        self.parents
            .iter()
            .filter(|edge| edge.kind == RequirementKind::Install)
            .collect()
    }

    /// Outgoing edges to `req_name` of the given kind.
    pub fn get_outgoing_edges(
        &self,
        req_name: &PackageName,
        kind: RequirementKind,
    ) -> Vec<&DependencyEdge> {
        self.children
            .iter()
            .filter(|edge| edge.kind == kind && edge.req.name == *req_name)
            .collect()
    }
}

/// Serialized node shape; field order matters for byte-stable output.
#[derive(Serialize, Deserialize)]
struct RawNode {
    download_url: String,
    pre_built: bool,
    version: String,
    canonicalized_name: String,
    edges: Vec<RawEdge>,
}

#[derive(Serialize, Deserialize)]
struct RawEdge {
    key: String,
    req_type: RequirementKind,
    req: String,
}

/// The dependency multigraph of one bootstrap run.
#[derive(Debug)]
pub struct DependencyGraph {
    nodes: IndexMap<String, DependencyNode>,
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        let mut nodes = IndexMap::new();
        // The root's version is irrelevant; zero mirrors the on-disk form.
        nodes.insert(
            ROOT.to_string(),
            DependencyNode::new(ROOT, Version::new([0]), String::new(), false),
        );
        Self { nodes }
    }

    pub fn from_file(path: &Path) -> Result<Self, GraphError> {
        let content = fs_err::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, GraphError> {
        let raw: IndexMap<String, RawNode> = serde_json::from_str(content)?;
        Self::from_raw(&raw)
    }

    fn from_raw(raw: &IndexMap<String, RawNode>) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        let mut stack = vec![ROOT.to_string()];
        let mut visited: HashSet<String> = HashSet::new();
        while let Some(current) = stack.pop() {
            if visited.contains(&current) {
                continue;
            }
            let node = raw
                .get(&current)
                .ok_or_else(|| GraphError::MissingNode(current.clone()))?;
            let (parent_name, parent_version) = if current == ROOT {
                (None, None)
            } else {
                let name = PackageName::new(&node.canonicalized_name).map_err(|err| {
                    GraphError::InvalidRequirement(
                        node.canonicalized_name.clone(),
                        err.to_string(),
                    )
                })?;
                let version = Version::from_str(&node.version).map_err(|err| {
                    GraphError::InvalidVersion(node.version.clone(), err.to_string())
                })?;
                (Some(name), Some(version))
            };
            for edge in &node.edges {
                let destination = raw
                    .get(&edge.key)
                    .ok_or_else(|| GraphError::MissingNode(edge.key.clone()))?;
                let req = Requirement::from_str(&edge.req).map_err(|err| {
                    GraphError::InvalidRequirement(edge.req.clone(), err.to_string())
                })?;
                let req_version = Version::from_str(&destination.version).map_err(|err| {
                    GraphError::InvalidVersion(destination.version.clone(), err.to_string())
                })?;
                graph.add_dependency(
                    parent_name.as_ref(),
                    parent_version.as_ref(),
                    edge.req_type,
                    &req,
                    &req_version,
                    &destination.download_url,
                    destination.pre_built,
                )?;
                stack.push(edge.key.clone());
            }
            visited.insert(current);
        }
        Ok(graph)
    }

    fn to_raw(&self) -> IndexMap<String, RawNode> {
        let mut raw = IndexMap::new();
        let mut stack = vec![ROOT.to_string()];
        let mut visited: HashSet<String> = HashSet::new();
        while let Some(current) = stack.pop() {
            if visited.contains(&current) {
                continue;
            }
            visited.insert(current.clone());
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            raw.insert(
                current,
                RawNode {
                    download_url: node.download_url.clone(),
                    pre_built: node.pre_built,
                    version: node.version.to_string(),
                    canonicalized_name: node.canonicalized_name.clone(),
                    edges: node
                        .children
                        .iter()
                        .map(|edge| RawEdge {
                            key: edge.key.clone(),
                            req_type: edge.kind,
                            req: edge.req.to_string(),
                        })
                        .collect(),
                },
            );
            for edge in &node.children {
                if !visited.contains(&edge.key) {
                    stack.push(edge.key.clone());
                }
            }
        }
        raw
    }

    /// Serialize to the on-disk JSON form. The key order is the
    /// depth-first walk from the root, which makes repeated serializations
    /// of equivalent graphs byte-identical.
    pub fn to_json(&self) -> Result<String, GraphError> {
        Ok(serde_json::to_string_pretty(&self.to_raw())?)
    }

    pub fn write_to_file(&self, path: &Path) -> Result<(), GraphError> {
        fs_err::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Record `req` resolving to `req_version` under the given parent.
    ///
    /// Both endpoints are upserted by key; the parent must already exist.
    /// `parent_name == None` means the edge hangs off the root.
    #[allow(clippy::too_many_arguments)]
    pub fn add_dependency(
        &mut self,
        parent_name: Option<&PackageName>,
        parent_version: Option<&Version>,
        kind: RequirementKind,
        req: &Requirement,
        req_version: &Version,
        download_url: &str,
        pre_built: bool,
    ) -> Result<(), GraphError> {
        debug!(
            "recording {kind} {} dependency {} -> {} {req_version}",
            parent_name.map_or_else(|| format!("({})", RequirementKind::TopLevel), ToString::to_string),
            parent_version.map_or_else(String::new, |v| format!("=={v}")),
            req.name,
        );

        let node_key = {
            let node = DependencyNode::new(
                req.name.as_str(),
                req_version.clone(),
                download_url.to_string(),
                pre_built,
            );
            let key = node.key.clone();
            self.nodes.entry(key.clone()).or_insert(node);
            key
        };

        let parent_key = match (parent_name, parent_version) {
            (Some(name), Some(version)) => format!("{name}=={version}"),
            _ => ROOT.to_string(),
        };
        if !self.nodes.contains_key(&parent_key) {
            return Err(GraphError::MissingParent {
                parent: parent_key,
                node: node_key,
            });
        }

        // Duplicate the edge on both endpoints, keyed by the opposite node.
        self.nodes[&parent_key].children.push(DependencyEdge {
            kind,
            req: req.clone(),
            key: node_key.clone(),
        });
        self.nodes[&node_key].parents.push(DependencyEdge {
            kind,
            req: req.clone(),
            key: parent_key,
        });
        Ok(())
    }

    pub fn get_root_node(&self) -> &DependencyNode {
        &self.nodes[ROOT]
    }

    pub fn get_node(&self, key: &str) -> Option<&DependencyNode> {
        self.nodes.get(key)
    }

    pub fn get_all_nodes(&self) -> impl Iterator<Item = &DependencyNode> {
        self.nodes.values()
    }

    /// Every node of the given name, across versions. Linear scan.
    pub fn get_nodes_by_name(&self, name: &PackageName) -> Vec<&DependencyNode> {
        self.nodes
            .values()
            .filter(|node| node.canonicalized_name == name.as_str())
            .collect()
    }

    /// Depth-first traversal from the root following only install-type
    /// edges, yielding each node at most once in discovery order.
    pub fn get_install_dependencies(&self) -> Vec<&DependencyNode> {
        let mut result = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        self.install_dfs(self.get_root_node(), &mut visited, &mut result);
        result
    }

    fn install_dfs<'graph>(
        &'graph self,
        node: &'graph DependencyNode,
        visited: &mut HashSet<&'graph str>,
        result: &mut Vec<&'graph DependencyNode>,
    ) {
        for edge in &node.children {
            if !edge.kind.is_install_requirement() {
                continue;
            }
            let Some(child) = self.nodes.get(&edge.key) else {
                continue;
            };
            if visited.insert(child.key.as_str()) {
                result.push(child);
                self.install_dfs(child, visited, result);
            }
        }
    }

    /// Install-closure nodes grouped by canonical name, in discovery order.
    pub fn get_install_dependency_versions(
        &self,
    ) -> IndexMap<String, Vec<&DependencyNode>> {
        let mut all_versions: IndexMap<String, Vec<&DependencyNode>> = IndexMap::new();
        for node in self.get_install_dependencies() {
            all_versions
                .entry(node.canonicalized_name.clone())
                .or_default()
                .push(node);
        }
        all_versions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> PackageName {
        PackageName::new(s).unwrap()
    }

    fn version(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn req(s: &str) -> Requirement {
        Requirement::from_str(s).unwrap()
    }

    /// root -> a (toplevel); a -> b (install); b -> c (build-backend);
    /// c -> d (install)
    fn sample_graph() -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        graph
            .add_dependency(None, None, RequirementKind::TopLevel, &req("a"), &version("1.0"), "url-a", false)
            .unwrap();
        graph
            .add_dependency(
                Some(&name("a")),
                Some(&version("1.0")),
                RequirementKind::Install,
                &req("b>=2"),
                &version("2.0"),
                "url-b",
                false,
            )
            .unwrap();
        graph
            .add_dependency(
                Some(&name("b")),
                Some(&version("2.0")),
                RequirementKind::BuildBackend,
                &req("c"),
                &version("3.0"),
                "url-c",
                false,
            )
            .unwrap();
        graph
            .add_dependency(
                Some(&name("c")),
                Some(&version("3.0")),
                RequirementKind::Install,
                &req("d"),
                &version("4.0"),
                "url-d",
                false,
            )
            .unwrap();
        graph
    }

    #[test]
    fn missing_parent_is_an_error() {
        let mut graph = DependencyGraph::new();
        let err = graph.add_dependency(
            Some(&name("ghost")),
            Some(&version("1.0")),
            RequirementKind::Install,
            &req("b"),
            &version("2.0"),
            "",
            false,
        );
        assert!(matches!(err, Err(GraphError::MissingParent { .. })));
    }

    #[test]
    fn same_key_collapses_to_one_node() {
        let mut graph = DependencyGraph::new();
        graph
            .add_dependency(None, None, RequirementKind::TopLevel, &req("a"), &version("1.0"), "u", false)
            .unwrap();
        graph
            .add_dependency(None, None, RequirementKind::TopLevel, &req("a[extra]"), &version("1.0"), "u", false)
            .unwrap();
        assert_eq!(graph.get_nodes_by_name(&name("a")).len(), 1);
        // Both edges survive on the root.
        assert_eq!(graph.get_root_node().children.len(), 2);
    }

    #[test]
    fn install_dependencies_skip_build_edges() {
        let graph = sample_graph();
        let keys: Vec<&str> = graph
            .get_install_dependencies()
            .iter()
            .map(|node| node.key.as_str())
            .collect();
        // c and d are only reachable over a build edge.
        assert_eq!(keys, vec!["a==1.0", "b==2.0"]);
    }

    #[test]
    fn install_dependencies_tolerate_cycles() {
        let mut graph = sample_graph();
        // b depends on a again: a cycle over install edges.
        graph
            .add_dependency(
                Some(&name("b")),
                Some(&version("2.0")),
                RequirementKind::Install,
                &req("a"),
                &version("1.0"),
                "url-a",
                false,
            )
            .unwrap();
        let keys: Vec<&str> = graph
            .get_install_dependencies()
            .iter()
            .map(|node| node.key.as_str())
            .collect();
        assert_eq!(keys, vec!["a==1.0", "b==2.0"]);
    }

    #[test]
    fn incoming_install_edges() {
        let graph = sample_graph();
        let b = graph.get_node("b==2.0").unwrap();
        let incoming = b.get_incoming_install_edges();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].key, "a==1.0");

        let c = graph.get_node("c==3.0").unwrap();
        assert!(c.get_incoming_install_edges().is_empty());
    }

    #[test]
    fn outgoing_edges_filter_by_name_and_kind() {
        let graph = sample_graph();
        let root = graph.get_root_node();
        assert_eq!(
            root.get_outgoing_edges(&name("a"), RequirementKind::TopLevel)
                .len(),
            1
        );
        assert!(root
            .get_outgoing_edges(&name("a"), RequirementKind::Install)
            .is_empty());
    }

    #[test]
    fn json_round_trip_preserves_structure() {
        let graph = sample_graph();
        let serialized = graph.to_json().unwrap();
        let reparsed = DependencyGraph::from_json(&serialized).unwrap();
        assert_eq!(
            reparsed.get_all_nodes().count(),
            graph.get_all_nodes().count()
        );
        let b = reparsed.get_node("b==2.0").unwrap();
        assert_eq!(b.download_url, "url-b");
        assert_eq!(b.children.len(), 1);
        assert_eq!(b.parents.len(), 1);
    }

    #[test]
    fn serialization_is_stable() {
        let graph = sample_graph();
        let first = graph.to_json().unwrap();
        let second = DependencyGraph::from_json(&first).unwrap().to_json().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn serialized_root_has_empty_key() {
        let graph = sample_graph();
        let raw: serde_json::Value = serde_json::from_str(&graph.to_json().unwrap()).unwrap();
        let root = raw.get("").unwrap();
        assert_eq!(root.get("version").unwrap(), "0");
        assert_eq!(root.get("canonicalized_name").unwrap(), "");
    }

    #[test]
    fn group_by_name() {
        let mut graph = sample_graph();
        graph
            .add_dependency(
                Some(&name("a")),
                Some(&version("1.0")),
                RequirementKind::Install,
                &req("b>=1"),
                &version("2.5"),
                "url-b25",
                false,
            )
            .unwrap();
        let versions = graph.get_install_dependency_versions();
        assert_eq!(versions.get("b").unwrap().len(), 2);
        assert_eq!(versions.get("a").unwrap().len(), 1);
    }
}
