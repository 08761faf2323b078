use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, info};

use fromager_build::{get_build_backend, read_wheel_metadata, HookCaller};
use fromager_pep508::{evaluate_marker, Requirement};
use fromager_pypi_types::Metadata;
use fromager_settings::parse_requirements_file;

use crate::context::WorkContext;
use crate::error::BootstrapError;

/// The prefix fromager uses for the requirement lists it embeds in a
/// wheel's dist-info.
pub(crate) const FROMAGER_BUILD_REQ_PREFIX: &str = "fromager";

pub(crate) const BUILD_SYSTEM_REQ_FILE_NAME: &str = "build-system-requirements.txt";
pub(crate) const BUILD_BACKEND_REQ_FILE_NAME: &str = "build-backend-requirements.txt";
pub(crate) const BUILD_SDIST_REQ_FILE_NAME: &str = "build-sdist-requirements.txt";

/// The build-system requirements: `[build-system] requires` from
/// `pyproject.toml`, filtered by markers. Cached in a requirements file
/// next to the sdist root; a pre-existing file (e.g. unpacked from a cached
/// wheel) short-circuits the computation.
pub(crate) fn get_build_system_dependencies(
    ctx: &WorkContext,
    req: &Requirement,
    sdist_root_dir: &Path,
) -> Result<BTreeSet<Requirement>, BootstrapError> {
    info!(
        "{}: getting build system dependencies for {req} in {}",
        req.name,
        sdist_root_dir.display()
    );
    let req_file = requirements_file_path(sdist_root_dir, BUILD_SYSTEM_REQ_FILE_NAME);
    if req_file.exists() {
        info!(
            "{}: loading build system dependencies from {}",
            req.name,
            req_file.display()
        );
        return read_requirements_file(&req_file);
    }

    let pbi = ctx.package_build_info(req);
    let backend = get_build_backend(&pbi.build_dir(sdist_root_dir))?;
    let deps = filter_requirement_strings(ctx, req, &backend.requires)?;
    write_requirements_file(&deps, &req_file)?;
    Ok(deps)
}

/// The build-backend requirements from the PEP 517
/// `get_requires_for_build_wheel` hook, with the same file caching.
pub(crate) fn get_build_backend_dependencies(
    ctx: &WorkContext,
    req: &Requirement,
    sdist_root_dir: &Path,
    hook_caller: &HookCaller,
) -> Result<BTreeSet<Requirement>, BootstrapError> {
    info!(
        "{}: getting build backend dependencies for {req} in {}",
        req.name,
        sdist_root_dir.display()
    );
    let req_file = requirements_file_path(sdist_root_dir, BUILD_BACKEND_REQ_FILE_NAME);
    if req_file.exists() {
        info!(
            "{}: loading build backend dependencies from {}",
            req.name,
            req_file.display()
        );
        return read_requirements_file(&req_file);
    }

    let raw = hook_caller.get_requires_for_build_wheel()?;
    let deps = filter_requirements(ctx, req, raw)?;
    write_requirements_file(&deps, &req_file)?;
    Ok(deps)
}

/// The sdist-build requirements. The backends in use expose no separate
/// hook for these, so this defaults to `get_requires_for_build_wheel` as
/// well, cached under its own filename.
pub(crate) fn get_build_sdist_dependencies(
    ctx: &WorkContext,
    req: &Requirement,
    sdist_root_dir: &Path,
    hook_caller: &HookCaller,
) -> Result<BTreeSet<Requirement>, BootstrapError> {
    info!(
        "{}: getting build sdist dependencies for {req} in {}",
        req.name,
        sdist_root_dir.display()
    );
    let req_file = requirements_file_path(sdist_root_dir, BUILD_SDIST_REQ_FILE_NAME);
    if req_file.exists() {
        info!(
            "{}: loading build sdist dependencies from {}",
            req.name,
            req_file.display()
        );
        return read_requirements_file(&req_file);
    }

    let raw = hook_caller.get_requires_for_build_wheel()?;
    let deps = filter_requirements(ctx, req, raw)?;
    write_requirements_file(&deps, &req_file)?;
    Ok(deps)
}

/// Installation dependencies of a built wheel: `Requires-Dist` from its
/// METADATA, filtered against the parent requirement's extras. The result
/// is also written to `requirements.txt` in the unpack dir.
pub(crate) fn get_install_dependencies_of_wheel(
    ctx: &WorkContext,
    req: &Requirement,
    wheel_filename: &Path,
    requirements_file_dir: &Path,
) -> Result<BTreeSet<Requirement>, BootstrapError> {
    info!(
        "{}: getting installation dependencies from {}",
        req.name,
        wheel_filename.display()
    );
    let metadata_bytes = read_wheel_metadata(wheel_filename)?;
    let metadata = Metadata::parse(&metadata_bytes)
        .map_err(|err| BootstrapError::Other(err.to_string()))?;
    let deps = filter_requirements(ctx, req, metadata.requires_dist)?;
    write_requirements_file(&deps, &requirements_file_dir.join("requirements.txt"))?;
    Ok(deps)
}

/// Drop requirements whose markers evaluate false in the parent's context.
pub(crate) fn filter_requirements(
    ctx: &WorkContext,
    req: &Requirement,
    requirements: impl IntoIterator<Item = Requirement>,
) -> Result<BTreeSet<Requirement>, BootstrapError> {
    let mut requires = BTreeSet::new();
    for candidate in requirements {
        if evaluate_marker(&ctx.marker_env, req, &candidate, &req.extras) {
            requires.insert(candidate);
        } else {
            debug!("{}: ignoring requirement {candidate}", req.name);
        }
    }
    Ok(requires)
}

fn filter_requirement_strings(
    ctx: &WorkContext,
    req: &Requirement,
    raw: &[String],
) -> Result<BTreeSet<Requirement>, BootstrapError> {
    let parsed: Vec<Requirement> = raw
        .iter()
        .map(|entry| {
            Requirement::from_str(entry)
                .map_err(|err| BootstrapError::InvalidRequirement(entry.clone(), err.to_string()))
        })
        .collect::<Result<_, _>>()?;
    filter_requirements(ctx, req, parsed)
}

/// The phase requirement files live next to the sdist root, in the unpack
/// dir.
fn requirements_file_path(sdist_root_dir: &Path, filename: &str) -> PathBuf {
    sdist_root_dir
        .parent()
        .unwrap_or(sdist_root_dir)
        .join(filename)
}

pub(crate) fn write_requirements_file(
    requirements: &BTreeSet<Requirement>,
    filename: &Path,
) -> Result<(), BootstrapError> {
    let mut content = String::new();
    for requirement in requirements {
        content.push_str(&requirement.to_string());
        content.push('\n');
    }
    fs_err::write(filename, content)?;
    Ok(())
}

pub(crate) fn read_requirements_file(
    filename: &Path,
) -> Result<BTreeSet<Requirement>, BootstrapError> {
    let mut requirements = BTreeSet::new();
    for line in parse_requirements_file(filename)? {
        let requirement = Requirement::from_str(&line)
            .map_err(|err| BootstrapError::InvalidRequirement(line.clone(), err.to_string()))?;
        requirements.insert(requirement);
    }
    Ok(requirements)
}
