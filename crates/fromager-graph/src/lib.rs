//! The persistent dependency graph: nodes keyed by `name==version`, typed
//! edges duplicated on both endpoints, JSON serialization with a stable
//! round trip, install-only traversal, and the build-order topology.

pub use crate::graph::{DependencyEdge, DependencyGraph, DependencyNode, GraphError, ROOT};
pub use crate::requirement_kind::RequirementKind;
pub use crate::topology::{BuildTopology, TopologyError};

mod graph;
mod requirement_kind;
mod topology;
