use thiserror::Error;

use fromager_graph::GraphError;

#[derive(Error, Debug)]
pub(crate) enum BootstrapError {
    /// A sub-requirement failed; `explain` is the formatted why-chain from
    /// the point of failure up to the top-level requirement.
    #[error("could not handle {explain}")]
    Wrapped {
        explain: String,
        #[source]
        source: Box<BootstrapError>,
    },

    /// pip could not install a build-time dependency. Carries the resolved
    /// versions of the peer build dependencies for the report.
    #[error(
        "missing dependency while installing {kind} requirements; resolved peers: [{}]\n{detail}",
        resolved.join(", ")
    )]
    MissingDependency {
        kind: String,
        resolved: Vec<String>,
        detail: String,
    },

    #[error("invalid requirement `{0}`: {1}")]
    InvalidRequirement(String, String),

    #[error(transparent)]
    Resolver(#[from] fromager_resolver::ResolverError),

    #[error(transparent)]
    Client(#[from] fromager_client::Error),

    #[error(transparent)]
    Build(#[from] fromager_build::BuildError),

    #[error(transparent)]
    Settings(#[from] fromager_settings::SettingsError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BootstrapError {
    pub(crate) fn wrap(self, explain: String) -> Self {
        Self::Wrapped {
            explain,
            source: Box::new(self),
        }
    }

    /// Whether the root cause is the network-isolation failure subtype.
    pub(crate) fn is_network_isolation(&self) -> bool {
        match self {
            Self::Wrapped { source, .. } => source.is_network_isolation(),
            Self::Build(fromager_build::BuildError::NetworkIsolation { .. }) => true,
            _ => false,
        }
    }
}

/// The substrings of pip's output that identify a missing-dependency
/// failure, as opposed to a compile error in the package itself.
pub(crate) fn is_missing_dependency_output(output: &str) -> bool {
    const MARKERS: &[&str] = &[
        "Could not find a version",
        "No matching distribution found",
        "ResolutionImpossible",
    ];
    MARKERS.iter().any(|marker| output.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dependency_markers() {
        assert!(is_missing_dependency_output(
            "ERROR: Could not find a version that satisfies the requirement foo"
        ));
        assert!(is_missing_dependency_output(
            "ERROR: No matching distribution found for foo"
        ));
        assert!(is_missing_dependency_output("raised ResolutionImpossible"));
        assert!(!is_missing_dependency_output("error: linker failed"));
    }

    #[test]
    fn network_isolation_detected_through_wrapping() {
        let inner = BootstrapError::Build(fromager_build::BuildError::NetworkIsolation {
            command: "pip install".to_string(),
            output_tail: "connection refused".to_string(),
        });
        let wrapped = inner.wrap("install dependency foo (1.0)".to_string());
        assert!(wrapped.is_network_isolation());
    }
}
