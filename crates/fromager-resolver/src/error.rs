use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolverError {
    /// No candidate satisfies the requirements and constraints; carries the
    /// considered candidates for diagnostics.
    #[error("unable to resolve `{requirement}`; considered: [{}]", considered.join(", "))]
    ResolutionImpossible {
        requirement: String,
        considered: Vec<String>,
    },

    #[error(transparent)]
    Client(#[from] fromager_client::Error),

    #[error("invalid version `{0}` from version source: {1}")]
    InvalidVersion(String, String),
}

impl ResolverError {
    pub(crate) fn impossible(requirement: impl ToString, considered: Vec<String>) -> Self {
        Self::ResolutionImpossible {
            requirement: requirement.to_string(),
            considered,
        }
    }
}
