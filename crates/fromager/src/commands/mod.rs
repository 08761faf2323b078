use std::process::ExitCode;

pub(crate) mod bootstrap;
pub(crate) mod build_order;
pub(crate) mod graph;

#[derive(Copy, Clone)]
pub(crate) enum ExitStatus {
    /// The command succeeded.
    Success,
    /// The command failed.
    Error,
    /// The command was missing required input.
    MissingInput,
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Success => ExitCode::from(0),
            ExitStatus::Error => ExitCode::from(1),
            ExitStatus::MissingInput => ExitCode::from(2),
        }
    }
}
