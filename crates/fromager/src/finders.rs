use std::path::{Path, PathBuf};

use tracing::debug;

use fromager_distribution_filename::{BuildTag, WheelFilename};
use fromager_pep440::Version;
use fromager_pep508::Requirement;

use crate::overrides;

/// The name spellings an artifact of `req` might use on disk: canonical,
/// underscore, verbatim, and dotted. Sdist and wheel names in the wild are
/// not reliably normalized.
fn candidate_bases(req: &Requirement, dist_version: &str) -> Vec<String> {
    let canonical = req.name.to_string();
    let module = req.name.as_override_module_name().to_string();
    let dotted = canonical.replace('-', ".");
    let mut bases = vec![
        format!("{module}-{dist_version}"),
        format!("{canonical}-{dist_version}"),
        format!("{dotted}-{dist_version}"),
    ];
    bases.dedup();
    bases
}

/// Find an existing source distribution for `req` in `downloads_dir`.
pub(crate) fn find_sdist(
    downloads_dir: &Path,
    req: &Requirement,
    dist_version: &Version,
) -> std::io::Result<Option<PathBuf>> {
    let module = req.name.as_override_module_name().to_string();
    if let Some(hook) = overrides::find_override(&module)
        .and_then(|hooks| hooks.expected_source_archive_name)
    {
        // The file must exist exactly as the override names it.
        let sdist_file = downloads_dir.join(hook(req, dist_version));
        return Ok(sdist_file.exists().then_some(sdist_file));
    }

    let version = dist_version.to_string();
    let bases = candidate_bases(req, &version);
    if !downloads_dir.is_dir() {
        return Ok(None);
    }
    for entry in fs_err::read_dir(downloads_dir)? {
        let entry = entry?;
        let filename = entry.file_name().to_string_lossy().to_lowercase();
        for extension in [".tar.gz", ".zip"] {
            let Some(stem) = filename.strip_suffix(extension) else {
                continue;
            };
            if bases.iter().any(|base| stem == base.to_lowercase()) {
                return Ok(Some(entry.path()));
            }
        }
    }
    Ok(None)
}

/// Find an existing wheel for `req` in `downloads_dir`, optionally
/// requiring the expected build tag.
pub(crate) fn find_wheel(
    downloads_dir: &Path,
    req: &Requirement,
    dist_version: &Version,
    build_tag: Option<&BuildTag>,
) -> std::io::Result<Option<PathBuf>> {
    let version = dist_version.to_string();
    let bases = candidate_bases(req, &version);
    if !downloads_dir.is_dir() {
        return Ok(None);
    }
    for entry in fs_err::read_dir(downloads_dir)? {
        let entry = entry?;
        let raw_name = entry.file_name().to_string_lossy().to_string();
        let filename = raw_name.to_lowercase();
        if !filename.ends_with(".whl") {
            continue;
        }
        let matches_base = bases
            .iter()
            .any(|base| filename.starts_with(&format!("{}-", base.to_lowercase())));
        if !matches_base {
            continue;
        }
        if let Some(expected) = build_tag {
            debug!("checking build tag of {raw_name} against {expected}");
            let Ok(parsed) = raw_name.parse::<WheelFilename>() else {
                continue;
            };
            if parsed.build_tag.as_ref() != Some(expected) {
                continue;
            }
        }
        return Ok(Some(entry.path()));
    }
    Ok(None)
}

/// Find an already-unpacked source tree for `req` in the work dir.
pub(crate) fn find_source_dir(
    work_dir: &Path,
    req: &Requirement,
    dist_version: &Version,
) -> std::io::Result<Option<PathBuf>> {
    let module = req.name.as_override_module_name().to_string();
    if let Some(hook) = overrides::find_override(&module)
        .and_then(|hooks| hooks.expected_source_directory_name)
    {
        let source_dir = work_dir.join(hook(req, dist_version));
        return Ok(source_dir.exists().then_some(source_dir));
    }
    let expected = work_dir
        .join(format!("{module}-{dist_version}"))
        .join(format!("{module}-{dist_version}"));
    Ok(expected.is_dir().then_some(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn req(s: &str) -> Requirement {
        Requirement::from_str(s).unwrap()
    }

    fn version(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn finds_sdist_with_alternate_spellings() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs_err::write(dir.path().join("oslo.messaging-14.7.0.tar.gz"), "")?;
        let found = find_sdist(dir.path(), &req("oslo-messaging"), &version("14.7.0"))?;
        assert!(found.is_some());
        Ok(())
    }

    #[test]
    fn finds_sdist_case_insensitively() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs_err::write(dir.path().join("Flask-1.0.tar.gz"), "")?;
        assert!(find_sdist(dir.path(), &req("flask"), &version("1.0"))?.is_some());
        assert!(find_sdist(dir.path(), &req("flask"), &version("2.0"))?.is_none());
        Ok(())
    }

    #[test]
    fn find_wheel_honors_build_tag() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs_err::write(dir.path().join("pkg-1.2-2-py3-none-any.whl"), "")?;

        let tag2: BuildTag = "2".parse().unwrap();
        let tag3: BuildTag = "3".parse().unwrap();
        assert!(find_wheel(dir.path(), &req("pkg"), &version("1.2"), Some(&tag2))?.is_some());
        assert!(find_wheel(dir.path(), &req("pkg"), &version("1.2"), Some(&tag3))?.is_none());
        assert!(find_wheel(dir.path(), &req("pkg"), &version("1.2"), None)?.is_some());
        Ok(())
    }

    #[test]
    fn missing_dir_is_none() -> anyhow::Result<()> {
        assert!(find_sdist(Path::new("/no/such/dir"), &req("x"), &version("1"))?.is_none());
        Ok(())
    }
}
