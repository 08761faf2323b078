use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{package}: failed to load settings (source: {source_path:?}): {err}")]
    InvalidPackageSettings {
        package: String,
        source_path: Option<PathBuf>,
        err: serde_yaml::Error,
    },

    #[error("failed to load global settings (source: {source_path:?}): {err}")]
    InvalidGlobalSettings {
        source_path: Option<PathBuf>,
        err: serde_yaml::Error,
    },

    #[error("`{0}` is not a relative path")]
    AbsoluteBuildDir(PathBuf),

    #[error("`{0}`: subshell '$()' is not supported")]
    SubshellInEnv(String),

    #[error("couldn't resolve `{template}`: unknown placeholder `{placeholder}`")]
    UnresolvedTemplate {
        template: String,
        placeholder: String,
    },

    #[error("constraints file {0} does not exist")]
    MissingConstraintsFile(PathBuf),

    #[error("invalid requirement `{0}` in {1}: {2}")]
    InvalidRequirement(String, PathBuf, String),

    #[error("invalid package name: {0}")]
    InvalidName(#[from] fromager_normalize::InvalidNameError),
}
