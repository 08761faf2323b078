//! Version and source resolution: the provider interface, the concrete
//! providers (simple index, generic callback, GitHub tags), and the
//! single-pass resolve driver.
//!
//! Modeled on resolvelib's provider protocol, narrowed to the sdist-first
//! use case: providers never expand dependencies, so one pin per
//! requirement settles the resolution.

pub use crate::candidate::Candidate;
pub use crate::error::ResolverError;
pub use crate::provider::{
    resolve_from_provider, resolve_requirement, CandidatesMap, GenericProvider, GitHubTagProvider,
    Provider, PyPiProvider, RequirementsMap, VersionSource,
};
pub use crate::version_map::VersionMap;

mod candidate;
mod error;
mod provider;
mod version_map;

/// The default index used to resolve source distributions.
pub const PYPI_SERVER_URL: &str = "https://pypi.org/simple/";

/// The GitHub API endpoint used by the tag provider.
pub const GITHUB_API_URL: &str = "https://api.github.com";
