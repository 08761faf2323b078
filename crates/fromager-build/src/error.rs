use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("command `{command}` failed with {status}:\n{output_tail}")]
    CommandFailed {
        command: String,
        status: String,
        output_tail: String,
    },

    /// The command tried to reach the network while isolation was on.
    #[error("command `{command}` attempted network access under isolation:\n{output_tail}")]
    NetworkIsolation {
        command: String,
        output_tail: String,
    },

    #[error("network isolation requested but not available on this platform")]
    IsolationUnavailable,

    #[error("{message}:\n--- stdout:\n{stdout}\n--- stderr:\n{stderr}\n---")]
    BackendFailure {
        message: String,
        stdout: String,
        stderr: String,
    },

    #[error("unsupported archive format (extension not recognized): {0}")]
    UnsupportedArchiveType(String),

    #[error("bad archive {path}: {message}")]
    BadArchive { path: PathBuf, message: String },

    #[error("refusing to extract unsafe path {0:?} from archive")]
    UnsafeArchivePath(PathBuf),

    #[error("patch {patch} failed to apply:\n{output_tail}")]
    PatchFailed {
        patch: PathBuf,
        output_tail: String,
    },

    #[error("invalid pyproject.toml: {0}")]
    PyprojectTomlInvalid(#[from] toml::de::Error),

    #[error("invalid requirement from build backend: {0}")]
    InvalidRequirement(String),

    #[error("wheel {0} has no `*.dist-info/{1}` entry")]
    MissingDistInfoFile(PathBuf, String),

    #[error("failed to read zip file {0}")]
    Zip(PathBuf, #[source] zip::result::ZipError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BuildError {
    pub(crate) fn from_command_output(
        message: String,
        output: &std::process::Output,
    ) -> Self {
        Self::BackendFailure {
            message,
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}
