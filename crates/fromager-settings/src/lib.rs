//! Build configuration: per-package settings loaded from a YAML directory,
//! the global settings file, pip-style constraints, and requirements-file
//! parsing.

pub use crate::constraints::Constraints;
pub use crate::error::SettingsError;
pub use crate::package::{
    BuildOptions, DownloadSource, EnvVars, PackageSettings, ProjectOverride, ResolverDist,
    VariantInfo, VariantVersionInfo,
};
pub use crate::requirements_file::parse_requirements_file;
pub use crate::settings::{PackageBuildInfo, Settings, SettingsFile};

mod constraints;
mod error;
mod package;
mod requirements_file;
mod settings;
mod template;
