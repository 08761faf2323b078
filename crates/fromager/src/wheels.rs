use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use fromager_build::{inject_wheel_dist_info_files, BuildEnvironment, HookCaller};
use fromager_distribution_filename::WheelFilename;
use fromager_pep440::Version;
use fromager_pep508::Requirement;
use fromager_resolver::{resolve_requirement, PyPiProvider, PYPI_SERVER_URL};

use crate::context::WorkContext;
use crate::dependencies::{
    BUILD_BACKEND_REQ_FILE_NAME, BUILD_SDIST_REQ_FILE_NAME, BUILD_SYSTEM_REQ_FILE_NAME,
    FROMAGER_BUILD_REQ_PREFIX,
};
use crate::error::BootstrapError;
use crate::overrides;

/// The wheel indexes to consult for a pre-built package: the package's
/// configured server first, then PyPI.
pub(crate) fn get_wheel_server_urls(
    ctx: &WorkContext,
    req: &Requirement,
    version: Option<&Version>,
) -> Vec<String> {
    let pbi = ctx.package_build_info(req);
    let mut servers = Vec::new();
    if let Some(url) = pbi.wheel_server_url(version) {
        servers.push(url);
    }
    servers.push(PYPI_SERVER_URL.to_string());
    servers
}

/// Resolve `req` to a pre-built wheel `(url, version)` on the first server
/// that has one.
pub(crate) async fn resolve_prebuilt_wheel(
    ctx: &WorkContext,
    req: &Requirement,
    wheel_server_urls: &[String],
) -> Result<(String, Version), BootstrapError> {
    let mut last_error = None;
    for server_url in wheel_server_urls {
        let provider = PyPiProvider::new(
            ctx.client.clone(),
            server_url.clone(),
            false,
            true,
            ctx.constraints.clone(),
            ctx.tags.clone(),
            ctx.python_version.clone(),
        );
        match resolve_requirement(&provider, req).await {
            Ok(resolution) => return Ok(resolution),
            Err(err) => {
                debug!("{}: no pre-built wheel on {server_url}: {err}", req.name);
                last_error = Some(err);
            }
        }
    }
    Err(last_error
        .map(BootstrapError::Resolver)
        .unwrap_or_else(|| BootstrapError::Other(format!("no wheel servers to resolve {req}"))))
}

/// Download a wheel into `output_directory`.
pub(crate) async fn download_wheel(
    ctx: &WorkContext,
    req: &Requirement,
    wheel_url: &str,
    output_directory: &Path,
) -> Result<PathBuf, BootstrapError> {
    let filename = wheel_filename_from_url(wheel_url)?;
    let destination = output_directory.join(filename);
    if destination.exists() {
        debug!("{}: already have {}", req.name, destination.display());
        return Ok(destination);
    }
    ctx.client.download_to(wheel_url, &destination).await?;
    info!("{}: downloaded wheel {}", req.name, destination.display());
    Ok(destination)
}

/// The wheel filename named by a download URL, fragment stripped.
pub(crate) fn wheel_filename_from_url(wheel_url: &str) -> Result<String, BootstrapError> {
    wheel_url
        .split('/')
        .next_back()
        .and_then(|name| name.split('#').next())
        .filter(|name| !name.is_empty())
        .map(String::from)
        .ok_or_else(|| BootstrapError::Other(format!("no filename in wheel URL {wheel_url}")))
}

/// Parse `(name, version, build_tag)` out of a wheel file path.
pub(crate) fn extract_info_from_wheel_file(
    wheel_file: &Path,
) -> Result<WheelFilename, BootstrapError> {
    let filename = wheel_file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    filename
        .parse::<WheelFilename>()
        .map_err(|err| BootstrapError::Other(err.to_string()))
}

/// Build a wheel for the prepared source via the backend's `build_wheel`
/// hook, embed the recorded build requirements into its dist-info, and
/// apply the changelog build tag to the filename.
pub(crate) fn build_wheel(
    ctx: &WorkContext,
    req: &Requirement,
    sdist_root_dir: &Path,
    version: &Version,
    hook_caller: &HookCaller,
) -> Result<PathBuf, BootstrapError> {
    info!(
        "{}: building wheel for {req} in {} writing to {}",
        req.name,
        sdist_root_dir.display(),
        ctx.wheels_build.display()
    );
    let built = hook_caller.build_wheel(&ctx.wheels_build)?;

    // Embed the three requirement lists so a later bootstrap that finds
    // this wheel in a cache can recover the build dependencies without
    // rebuilding.
    let unpack_dir = sdist_root_dir
        .parent()
        .expect("sdist root has a parent")
        .to_path_buf();
    let mut embedded = Vec::new();
    for filename in [
        BUILD_SYSTEM_REQ_FILE_NAME,
        BUILD_BACKEND_REQ_FILE_NAME,
        BUILD_SDIST_REQ_FILE_NAME,
    ] {
        let path = unpack_dir.join(filename);
        let content = if path.exists() {
            fs_err::read_to_string(&path)?
        } else {
            String::new()
        };
        embedded.push((format!("{FROMAGER_BUILD_REQ_PREFIX}-{filename}"), content));
    }
    inject_wheel_dist_info_files(&built, &embedded)?;

    let built = apply_build_tag(ctx, req, version, &built)?;
    let module = req.name.as_override_module_name().to_string();
    if let Some(hook) = overrides::find_override(&module).and_then(|hooks| hooks.post_build) {
        hook(req, version, &built);
    }
    info!("{}: built wheel {}", req.name, built.display());
    Ok(built)
}

/// Rename the built wheel to carry the changelog build tag, when one is
/// configured for this version.
fn apply_build_tag(
    ctx: &WorkContext,
    req: &Requirement,
    version: &Version,
    wheel_path: &Path,
) -> Result<PathBuf, BootstrapError> {
    let pbi = ctx.package_build_info(req);
    let Some(build_tag) = pbi.build_tag(version) else {
        return Ok(wheel_path.to_path_buf());
    };
    let mut parsed = extract_info_from_wheel_file(wheel_path)?;
    if parsed.build_tag.as_ref() == Some(&build_tag) {
        return Ok(wheel_path.to_path_buf());
    }
    parsed.build_tag = Some(build_tag);
    let renamed = wheel_path
        .parent()
        .expect("wheel path has a parent")
        .join(parsed.to_string());
    fs_err::rename(wheel_path, &renamed)?;
    debug!(
        "{}: renamed wheel to {} for build tag",
        req.name,
        renamed.display()
    );
    Ok(renamed)
}

/// The env vars handed to build hooks: the package's composed settings env
/// plus the parallelism and offline knobs.
pub(crate) fn build_environ(
    ctx: &WorkContext,
    req: &Requirement,
    version: Option<&Version>,
    build_env: &BuildEnvironment,
) -> Result<HashMap<String, String>, BootstrapError> {
    let pbi = ctx.package_build_info(req);
    let template_env: indexmap::IndexMap<String, String> = std::env::vars().collect();
    let mut environ: HashMap<String, String> = pbi
        .get_extra_environ(&template_env, version)?
        .into_iter()
        .collect();

    // Build Rust extensions without network access.
    environ.insert("CARGO_NET_OFFLINE".to_string(), "true".to_string());

    let jobs = pbi.parallel_jobs();
    let makeflags = format!(
        "{} -j{jobs}",
        environ
            .get("MAKEFLAGS")
            .cloned()
            .or_else(|| std::env::var("MAKEFLAGS").ok())
            .unwrap_or_default()
    );
    environ.insert("MAKEFLAGS".to_string(), makeflags.trim().to_string());
    environ.insert("CMAKE_BUILD_PARALLEL_LEVEL".to_string(), jobs.to_string());
    environ.insert("MAX_JOBS".to_string(), jobs.to_string());

    // Put the build environment first on PATH and advertise it as the
    // active virtualenv so tools like maturin find it.
    let existing_path = std::env::var("PATH").unwrap_or_default();
    let bin_dir = build_env.python().parent().expect("python has a parent");
    let path = if existing_path.is_empty() {
        bin_dir.to_string_lossy().to_string()
    } else {
        format!("{}:{existing_path}", bin_dir.to_string_lossy())
    };
    environ.insert("PATH".to_string(), path);
    environ.insert(
        "VIRTUAL_ENV".to_string(),
        build_env.path().to_string_lossy().to_string(),
    );
    Ok(environ)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn wheel_info_from_path() {
        let parsed = extract_info_from_wheel_file(Path::new(
            "/tmp/wheels/pkg-1.2-2-py3-none-any.whl",
        ))
        .unwrap();
        assert_eq!(parsed.version, Version::from_str("1.2").unwrap());
        assert_eq!(parsed.build_tag.unwrap().number(), 2);
    }

    #[test]
    fn wheel_url_filename() {
        let url = "https://files.example.com/pkg/pkg-1.0-py3-none-any.whl#sha256=abc";
        assert_eq!(
            wheel_filename_from_url(url).unwrap(),
            "pkg-1.0-py3-none-any.whl"
        );
        assert!(wheel_filename_from_url("https://files.example.com/").is_err());
    }
}
