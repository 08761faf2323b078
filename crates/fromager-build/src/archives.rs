use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use fs_err::File;
use tracing::debug;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::BuildError;

/// Extract a `.tar.gz` or `.zip` archive into `destination`, rejecting
/// absolute paths and `..` components.
///
/// Returns the single top-level directory the archive contained.
pub fn extract_archive(path: &Path, destination: &Path) -> Result<PathBuf, BuildError> {
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    fs_err::create_dir_all(destination)?;
    if filename.ends_with(".zip") {
        extract_zip(path, destination)?;
    } else if filename.ends_with(".tar.gz") || filename.ends_with(".tgz") {
        extract_tar_gz(path, destination)?;
    } else {
        return Err(BuildError::UnsupportedArchiveType(filename));
    }

    // > A .tar.gz source distribution (sdist) contains a single top-level
    // > directory called `{name}-{version}`, containing the source files.
    let mut entries = fs_err::read_dir(destination)?;
    let first = entries
        .next()
        .transpose()?
        .ok_or_else(|| BuildError::BadArchive {
            path: path.to_path_buf(),
            message: "archive is empty".to_string(),
        })?;
    if entries.next().is_some() {
        return Err(BuildError::BadArchive {
            path: path.to_path_buf(),
            message: "the top level of the archive must contain exactly one directory".to_string(),
        });
    }
    Ok(first.path())
}

fn checked_join(destination: &Path, entry_path: &Path) -> Result<PathBuf, BuildError> {
    if entry_path.is_absolute() {
        return Err(BuildError::UnsafeArchivePath(entry_path.to_path_buf()));
    }
    for component in entry_path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(BuildError::UnsafeArchivePath(entry_path.to_path_buf()));
        }
    }
    Ok(destination.join(entry_path))
}

fn extract_tar_gz(path: &Path, destination: &Path) -> Result<(), BuildError> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(path)?));
    let mut extracted_any = false;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let target = checked_join(destination, &entry_path)?;
        if entry.header().entry_type().is_dir() {
            fs_err::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs_err::create_dir_all(parent)?;
            }
            entry.unpack(&target)?;
        }
        extracted_any = true;
    }
    if !extracted_any {
        return Err(BuildError::BadArchive {
            path: path.to_path_buf(),
            message: "empty tar file encountered".to_string(),
        });
    }
    Ok(())
}

fn extract_zip(path: &Path, destination: &Path) -> Result<(), BuildError> {
    let mut archive =
        ZipArchive::new(File::open(path)?).map_err(|err| BuildError::Zip(path.to_path_buf(), err))?;
    if archive.len() == 0 {
        return Err(BuildError::BadArchive {
            path: path.to_path_buf(),
            message: "empty zip file encountered".to_string(),
        });
    }
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| BuildError::Zip(path.to_path_buf(), err))?;
        let Some(entry_path) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(BuildError::UnsafeArchivePath(PathBuf::from(entry.name())));
        };
        let target = checked_join(destination, &entry_path)?;
        if entry.is_dir() {
            fs_err::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs_err::create_dir_all(parent)?;
            }
            let mut out = File::create(&target)?;
            std::io::copy(&mut entry, &mut out)?;
        }
    }
    Ok(())
}

/// Write a reproducible `.tar.gz` of `source_dir`: entries sorted, a fixed
/// mtime, numeric root ownership, and mode normalized to preserve only the
/// executable bit.
pub fn make_reproducible_tar_gz(
    source_dir: &Path,
    prefix: &str,
    output: &Path,
) -> Result<(), BuildError> {
    let mut paths = Vec::new();
    collect_paths(source_dir, &mut paths)?;
    paths.sort();

    let file = File::create(output)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for path in paths {
        let relative = path
            .strip_prefix(source_dir)
            .expect("collected paths are under source_dir");
        let archive_path = Path::new(prefix).join(relative);

        let metadata = fs_err::metadata(&path)?;
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_username("root")?;
        header.set_groupname("root")?;
        if metadata.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder.append_data(&mut header, &archive_path, std::io::empty())?;
        } else {
            let executable = is_executable(&metadata);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(if executable { 0o755 } else { 0o644 });
            header.set_size(metadata.len());
            let mut reader = File::open(&path)?;
            builder.append_data(&mut header, &archive_path, &mut reader)?;
        }
    }
    builder.into_inner()?.finish()?;
    Ok(())
}

fn collect_paths(dir: &Path, acc: &mut Vec<PathBuf>) -> Result<(), BuildError> {
    for entry in fs_err::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        acc.push(path.clone());
        if path.is_dir() {
            collect_paths(&path, acc)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

/// Read `*.dist-info/METADATA` out of a wheel.
pub fn read_wheel_metadata(wheel: &Path) -> Result<Vec<u8>, BuildError> {
    let mut archive =
        ZipArchive::new(File::open(wheel)?).map_err(|err| BuildError::Zip(wheel.to_path_buf(), err))?;
    let entry_name = archive
        .file_names()
        .find(|name| name.ends_with(".dist-info/METADATA") && name.matches('/').count() == 1)
        .map(String::from)
        .ok_or_else(|| {
            BuildError::MissingDistInfoFile(wheel.to_path_buf(), "METADATA".to_string())
        })?;
    let mut contents = Vec::new();
    archive
        .by_name(&entry_name)
        .map_err(|err| BuildError::Zip(wheel.to_path_buf(), err))?
        .read_to_end(&mut contents)?;
    Ok(contents)
}

/// Extract one file from the wheel's `.dist-info` directory into
/// `destination/<output_name>`.
pub fn extract_wheel_dist_info_file(
    wheel: &Path,
    dist_info_filename: &str,
    destination: &Path,
    output_name: &str,
) -> Result<PathBuf, BuildError> {
    let mut archive =
        ZipArchive::new(File::open(wheel)?).map_err(|err| BuildError::Zip(wheel.to_path_buf(), err))?;
    let entry_name = archive
        .file_names()
        .find(|name| {
            name.ends_with(&format!(".dist-info/{dist_info_filename}"))
                && name.matches('/').count() == 1
        })
        .map(String::from)
        .ok_or_else(|| {
            BuildError::MissingDistInfoFile(wheel.to_path_buf(), dist_info_filename.to_string())
        })?;
    let mut contents = Vec::new();
    archive
        .by_name(&entry_name)
        .map_err(|err| BuildError::Zip(wheel.to_path_buf(), err))?
        .read_to_end(&mut contents)?;

    fs_err::create_dir_all(destination)?;
    let output_path = destination.join(output_name);
    fs_err::write(&output_path, contents)?;
    debug!("extracted {entry_name} to {}", output_path.display());
    Ok(output_path)
}

/// Append text files to the wheel's `.dist-info` directory, rewriting the
/// archive in place (the zip format has no in-place append that tools
/// reliably read).
pub fn inject_wheel_dist_info_files(
    wheel: &Path,
    files: &[(String, String)],
) -> Result<(), BuildError> {
    let mut archive =
        ZipArchive::new(File::open(wheel)?).map_err(|err| BuildError::Zip(wheel.to_path_buf(), err))?;
    let dist_info_dir = archive
        .file_names()
        .find_map(|name| {
            name.split_once('/').and_then(|(first, _)| {
                first.ends_with(".dist-info").then(|| first.to_string())
            })
        })
        .ok_or_else(|| BuildError::MissingDistInfoFile(wheel.to_path_buf(), String::new()))?;

    let rewritten = wheel.with_extension("whl.tmp");
    {
        let mut writer = ZipWriter::new(File::create(&rewritten)?);
        let options: FileOptions =
            FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for index in 0..archive.len() {
            let entry = archive
                .by_index_raw(index)
                .map_err(|err| BuildError::Zip(wheel.to_path_buf(), err))?;
            writer
                .raw_copy_file(entry)
                .map_err(|err| BuildError::Zip(wheel.to_path_buf(), err))?;
        }
        for (filename, content) in files {
            writer
                .start_file(format!("{dist_info_dir}/{filename}"), options)
                .map_err(|err| BuildError::Zip(wheel.to_path_buf(), err))?;
            writer.write_all(content.as_bytes())?;
        }
        writer
            .finish()
            .map_err(|err| BuildError::Zip(wheel.to_path_buf(), err))?;
    }
    fs_err::rename(&rewritten, wheel)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tar_gz(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn make_wheel(path: &Path, dist_info: &str, extra: &[(&str, &str)]) {
        let mut writer = ZipWriter::new(File::create(path).unwrap());
        let options: FileOptions = FileOptions::default();
        writer
            .start_file(format!("{dist_info}/METADATA"), options)
            .unwrap();
        writer
            .write_all(b"Metadata-Version: 2.1\nName: pkg\nVersion: 1.0\n\n")
            .unwrap();
        for (name, content) in extra {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn extract_single_root() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let archive = dir.path().join("pkg-1.0.tar.gz");
        make_tar_gz(&archive, &[("pkg-1.0/setup.py", "print('hi')\n")]);
        let root = extract_archive(&archive, &dir.path().join("out"))?;
        assert!(root.ends_with("pkg-1.0"));
        assert!(root.join("setup.py").is_file());
        Ok(())
    }

    #[test]
    fn reject_parent_traversal() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let archive = dir.path().join("evil-1.0.tar.gz");
        make_tar_gz(&archive, &[("../evil.txt", "boo")]);
        let err = extract_archive(&archive, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, BuildError::UnsafeArchivePath(_)));
        Ok(())
    }

    #[test]
    fn unknown_extension_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let archive = dir.path().join("pkg-1.0.rpm");
        fs_err::write(&archive, "not an archive")?;
        let err = extract_archive(&archive, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, BuildError::UnsupportedArchiveType(_)));
        Ok(())
    }

    #[test]
    fn wheel_metadata_read() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let wheel = dir.path().join("pkg-1.0-py3-none-any.whl");
        make_wheel(&wheel, "pkg-1.0.dist-info", &[]);
        let metadata = read_wheel_metadata(&wheel)?;
        assert!(String::from_utf8_lossy(&metadata).contains("Name: pkg"));
        Ok(())
    }

    #[test]
    fn inject_and_extract_dist_info_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let wheel = dir.path().join("pkg-1.0-py3-none-any.whl");
        make_wheel(&wheel, "pkg-1.0.dist-info", &[("pkg/__init__.py", "")]);

        inject_wheel_dist_info_files(
            &wheel,
            &[(
                "fromager-build-system-requirements.txt".to_string(),
                "setuptools\n".to_string(),
            )],
        )?;

        let out = extract_wheel_dist_info_file(
            &wheel,
            "fromager-build-system-requirements.txt",
            dir.path(),
            "build-system-requirements.txt",
        )?;
        assert_eq!(fs_err::read_to_string(out)?, "setuptools\n");
        // The original contents survive the rewrite.
        assert!(String::from_utf8_lossy(&read_wheel_metadata(&wheel)?).contains("Name: pkg"));
        Ok(())
    }

    #[test]
    fn reproducible_tar_is_stable() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("src");
        fs_err::create_dir_all(source.join("sub"))?;
        fs_err::write(source.join("b.txt"), "bbb")?;
        fs_err::write(source.join("sub/a.txt"), "aaa")?;

        let first = dir.path().join("one.tar.gz");
        let second = dir.path().join("two.tar.gz");
        make_reproducible_tar_gz(&source, "pkg-1.0", &first)?;
        make_reproducible_tar_gz(&source, "pkg-1.0", &second)?;
        assert_eq!(fs_err::read(&first)?, fs_err::read(&second)?);
        Ok(())
    }
}
