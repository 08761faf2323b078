use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use fromager_build::{
    apply_patch, extract_archive, make_reproducible_tar_gz, BuildEnvironment, HookCaller,
};
use fromager_pep440::Version;
use fromager_pep508::Requirement;
use fromager_resolver::{resolve_requirement, PyPiProvider};
use fromager_settings::ProjectOverride;

use crate::context::WorkContext;
use crate::error::BootstrapError;
use crate::finders;
use crate::overrides;

/// How the source of a package was obtained, recorded in the build order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum SourceKind {
    Sdist,
    Prebuilt,
    Override,
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sdist => write!(f, "sdist"),
            Self::Prebuilt => write!(f, "prebuilt"),
            Self::Override => write!(f, "override"),
        }
    }
}

/// Whether this package's source comes from the default index or from an
/// override (plugin hook or configured download URL).
pub(crate) fn get_source_type(ctx: &WorkContext, req: &Requirement) -> SourceKind {
    let pbi = ctx.package_build_info(req);
    if overrides::has_source_override(&pbi.override_module_name()) || pbi.has_download_source() {
        SourceKind::Override
    } else {
        SourceKind::Sdist
    }
}

/// Resolve a requirement to an sdist `(url, version)` on the configured
/// index.
pub(crate) async fn resolve_source(
    ctx: &WorkContext,
    req: &Requirement,
    sdist_server_url: &str,
) -> Result<(String, Version), BootstrapError> {
    let pbi = ctx.package_build_info(req);
    let module = pbi.override_module_name();
    if let Some(hook) = overrides::find_override(&module).and_then(|hooks| hooks.resolve_source) {
        if let Some(resolution) = hook(req) {
            return Ok(resolution);
        }
    }

    let constraint = ctx.constraints.get_constraint(&req.name);
    debug!(
        "{}: resolving requirement {req} using {sdist_server_url} with constraint {constraint:?}",
        req.name
    );
    let provider = PyPiProvider::new(
        ctx.client.clone(),
        pbi.resolver_sdist_server_url(sdist_server_url),
        pbi.resolver_include_sdists(),
        pbi.resolver_include_wheels(),
        ctx.constraints.clone(),
        ctx.tags.clone(),
        ctx.python_version.clone(),
    );
    Ok(resolve_requirement(&provider, req).await?)
}

/// Download the source archive for `req`, honoring the package's download
/// template, and sanity-check the result. A corrupt download is deleted.
pub(crate) async fn download_source(
    ctx: &WorkContext,
    req: &Requirement,
    version: &Version,
    download_url: &str,
) -> Result<PathBuf, BootstrapError> {
    let pbi = ctx.package_build_info(req);
    let module = pbi.override_module_name();
    if let Some(hook) = overrides::find_override(&module).and_then(|hooks| hooks.download_source)
    {
        if let Some(path) = hook(req, version, download_url) {
            return Ok(path);
        }
    }

    let url = pbi
        .download_source_url(Some(version), Some(download_url))?
        .expect("a default URL was supplied");
    let destination_filename = match pbi.download_source_destination_filename(Some(version), None)?
    {
        Some(filename) => filename,
        None => filename_from_url(&url)?,
    };

    let outfile = ctx.sdists_downloads.join(&destination_filename);
    if outfile.exists() {
        debug!("already have {}", outfile.display());
        return Ok(outfile);
    }
    ctx.client.download_to(&url, &outfile).await?;
    info!("saved {}", outfile.display());

    if let Err(err) = check_archive(&outfile) {
        fs_err::remove_file(&outfile)?;
        return Err(err);
    }
    Ok(outfile)
}

fn filename_from_url(url: &str) -> Result<String, BootstrapError> {
    let parsed = Url::parse(url)
        .map_err(|err| BootstrapError::Other(format!("invalid download URL {url}: {err}")))?;
    parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(String::from)
        .ok_or_else(|| BootstrapError::Other(format!("no filename in download URL {url}")))
}

/// Reject empty or non-archive downloads (e.g. an index.html error page).
fn check_archive(path: &Path) -> Result<(), BootstrapError> {
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let ok = if filename.ends_with(".zip") {
        fs_err::File::open(path)
            .map_err(BootstrapError::Io)
            .and_then(|file| {
                zip::ZipArchive::new(file.into_parts().0)
                    .map(|archive| archive.len() > 0)
                    .map_err(|err| BootstrapError::Other(err.to_string()))
            })?
    } else if filename.ends_with(".tar.gz") || filename.ends_with(".tgz") {
        let file = fs_err::File::open(path)?;
        let decoder = flate2::read::GzDecoder::new(file.into_parts().0);
        let mut archive = tar::Archive::new(decoder);
        archive
            .entries()
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    } else {
        false
    };
    if !ok {
        return Err(BootstrapError::Build(
            fromager_build::BuildError::BadArchive {
                path: path.to_path_buf(),
                message: "downloaded file is empty or not a recognized archive".to_string(),
            },
        ));
    }
    Ok(())
}

/// Unpack the source archive into `<work_dir>/<module>-<version>/` and
/// force the extracted root to `<module>-<version>`, since sdist root
/// directory names are not reliably normalized.
pub(crate) fn unpack_source(
    ctx: &WorkContext,
    req: &Requirement,
    version: &Version,
    source_filename: &Path,
) -> Result<(PathBuf, bool), BootstrapError> {
    let module = req.name.as_override_module_name().to_string();
    let expected_name = format!("{module}-{version}");
    let unpack_dir = ctx.work_dir.join(&expected_name);
    if !ctx.cleanup {
        if let Some(existing) = finders::find_source_dir(&ctx.work_dir, req, version)? {
            info!("reusing {}", existing.display());
            return Ok((existing, false));
        }
    }
    if unpack_dir.exists() {
        if ctx.cleanup {
            debug!("cleaning up {}", unpack_dir.display());
            fs_err::remove_dir_all(&unpack_dir)?;
        } else {
            info!("reusing {}", unpack_dir.display());
            return Ok((unpack_dir.join(&expected_name), false));
        }
    }

    debug!(
        "unpacking {} to {}",
        source_filename.display(),
        unpack_dir.display()
    );
    let unpacked_root = extract_archive(source_filename, &unpack_dir)?;
    let desired = unpack_dir.join(&expected_name);
    if unpacked_root != desired {
        fs_err::rename(&unpacked_root, &desired)?;
    }
    Ok((desired, true))
}

/// The per-source record written next to the unpacked tree so later steps
/// (and humans) can see what was prepared.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct BuildMeta {
    pub req: String,
    #[serde(rename = "source-filename")]
    pub source_filename: String,
    pub version: String,
}

/// Prepare an unpacked source tree: apply patches in lexicographic order,
/// apply the `pyproject.toml` project override, and write
/// `build-meta.json`.
pub(crate) fn prepare_source(
    ctx: &WorkContext,
    req: &Requirement,
    source_filename: &Path,
    version: &Version,
) -> Result<PathBuf, BootstrapError> {
    info!("{}: preparing source for {req} from {}", req.name, source_filename.display());
    let (sdist_root_dir, newly_unpacked) = unpack_source(ctx, req, version, source_filename)?;
    if newly_unpacked {
        let pbi = ctx.package_build_info(req);
        for patch in pbi.patches(version)? {
            apply_patch(&patch, &sdist_root_dir)?;
        }
        apply_project_override(&pbi.build_dir(&sdist_root_dir), pbi.project_override())?;
    }

    let build_meta = BuildMeta {
        req: req.to_string(),
        source_filename: source_filename.to_string_lossy().to_string(),
        version: version.to_string(),
    };
    let meta_path = sdist_root_dir
        .parent()
        .expect("unpack dir has a parent")
        .join("build-meta.json");
    fs_err::write(&meta_path, serde_json::to_string_pretty(&build_meta)?)?;
    info!("{}: prepared source in {}", req.name, sdist_root_dir.display());
    Ok(sdist_root_dir)
}

/// Apply the configured mutations to `[build-system] requires`: update or
/// add the listed requirements, then drop the removals.
pub(crate) fn apply_project_override(
    build_dir: &Path,
    project_override: &ProjectOverride,
) -> Result<(), BootstrapError> {
    if project_override.update_build_requires.is_empty()
        && project_override.remove_build_requires.is_empty()
    {
        return Ok(());
    }
    let pyproject_path = build_dir.join("pyproject.toml");
    let mut parsed: toml::Value = if pyproject_path.exists() {
        toml::from_str(&fs_err::read_to_string(&pyproject_path)?)
            .map_err(|err| BootstrapError::Other(format!("invalid pyproject.toml: {err}")))?
    } else {
        toml::Value::Table(Default::default())
    };

    let table = parsed
        .as_table_mut()
        .ok_or_else(|| BootstrapError::Other("pyproject.toml is not a table".to_string()))?;
    let build_system = table
        .entry("build-system")
        .or_insert_with(|| toml::Value::Table(Default::default()))
        .as_table_mut()
        .ok_or_else(|| BootstrapError::Other("[build-system] is not a table".to_string()))?;

    let mut requires: Vec<Requirement> = build_system
        .get("requires")
        .and_then(|value| value.as_array())
        .map(|array| {
            array
                .iter()
                .filter_map(|value| value.as_str())
                .filter_map(|raw| Requirement::from_str(raw).ok())
                .collect()
        })
        .unwrap_or_default();

    for raw in &project_override.update_build_requires {
        let update = Requirement::from_str(raw)
            .map_err(|err| BootstrapError::InvalidRequirement(raw.clone(), err.to_string()))?;
        match requires.iter_mut().find(|existing| existing.name == update.name) {
            Some(existing) => *existing = update,
            None => requires.push(update),
        }
    }
    requires.retain(|requirement| {
        !project_override
            .remove_build_requires
            .contains(&requirement.name)
    });

    build_system.insert(
        "requires".to_string(),
        toml::Value::Array(
            requires
                .iter()
                .map(|requirement| toml::Value::String(requirement.to_string()))
                .collect(),
        ),
    );
    fs_err::write(
        &pyproject_path,
        toml::to_string_pretty(&parsed)
            .map_err(|err| BootstrapError::Other(err.to_string()))?,
    )?;
    debug!("rewrote {} with overridden build requires", pyproject_path.display());
    Ok(())
}

/// Build an sdist for the prepared tree: try the backend's `build_sdist`
/// hook, fall back to a reproducible tar of the tree. A failure here is a
/// warning, not a fatal error; the wheel build decides success.
pub(crate) fn build_sdist(
    ctx: &WorkContext,
    req: &Requirement,
    version: &Version,
    sdist_root_dir: &Path,
    hook_caller: &HookCaller,
    _build_env: &BuildEnvironment,
) -> Result<PathBuf, BootstrapError> {
    let module = req.name.as_override_module_name().to_string();
    let target_name = format!("{module}-{version}.tar.gz");
    let target = ctx.sdists_builds.join(&target_name);

    match hook_caller.build_sdist(&ctx.sdists_builds) {
        Ok(built) => {
            info!("{}: built sdist {}", req.name, built.display());
            Ok(built)
        }
        Err(err) => {
            warn!(
                "{}: build_sdist hook failed ({err}); writing reproducible tar instead",
                req.name
            );
            make_reproducible_tar_gz(sdist_root_dir, &format!("{module}-{version}"), &target)?;
            info!("{}: wrote sdist {}", req.name, target.display());
            Ok(target)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fromager_normalize::PackageName;

    fn req(s: &str) -> Requirement {
        Requirement::from_str(s).unwrap()
    }

    #[test]
    fn source_kind_strings() {
        assert_eq!(SourceKind::Sdist.to_string(), "sdist");
        assert_eq!(SourceKind::Prebuilt.to_string(), "prebuilt");
        assert_eq!(SourceKind::Override.to_string(), "override");
        assert_eq!(
            serde_json::to_string(&SourceKind::Override).unwrap(),
            "\"override\""
        );
    }

    #[test]
    fn filename_from_url_takes_last_segment() {
        assert_eq!(
            filename_from_url("https://files.example.com/a/b/pbr-6.0.0.tar.gz").unwrap(),
            "pbr-6.0.0.tar.gz"
        );
        assert!(filename_from_url("not a url").is_err());
    }

    #[test]
    fn project_override_updates_and_removes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs_err::write(
            dir.path().join("pyproject.toml"),
            "[build-system]\nrequires = [\"setuptools<60\", \"ninja\", \"wheel\"]\n",
        )?;
        let project_override = ProjectOverride {
            update_build_requires: vec!["setuptools>=68".to_string()],
            remove_build_requires: vec![PackageName::new("ninja").unwrap()],
        };
        apply_project_override(dir.path(), &project_override)?;

        let rewritten = fs_err::read_to_string(dir.path().join("pyproject.toml"))?;
        assert!(rewritten.contains("setuptools>=68"));
        assert!(!rewritten.contains("setuptools<60"));
        assert!(!rewritten.contains("ninja"));
        assert!(rewritten.contains("wheel"));
        Ok(())
    }

    #[test]
    fn empty_project_override_leaves_file_alone() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        apply_project_override(dir.path(), &ProjectOverride::default())?;
        assert!(!dir.path().join("pyproject.toml").exists());
        Ok(())
    }

    #[test]
    fn check_archive_rejects_html() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pkg-1.0.tar.gz");
        fs_err::write(&path, "<html>not found</html>")?;
        assert!(check_archive(&path).is_err());
        Ok(())
    }
}
