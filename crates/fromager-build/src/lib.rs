//! The engine's external contracts: subprocess execution (optionally
//! network-isolated), virtualenv build environments, PEP 517 hook calls,
//! archive I/O, and patch application.

pub use crate::archives::{
    extract_archive, extract_wheel_dist_info_file, inject_wheel_dist_info_files,
    make_reproducible_tar_gz, read_wheel_metadata,
};
pub use crate::commands::{network_isolation_available, run_command, CommandOptions};
pub use crate::environment::BuildEnvironment;
pub use crate::error::BuildError;
pub use crate::hooks::{get_build_backend, BuildBackend, HookCaller};
pub use crate::patches::apply_patch;

mod archives;
mod commands;
mod environment;
mod error;
mod hooks;
mod patches;
