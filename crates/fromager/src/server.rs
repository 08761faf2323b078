use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use fromager_distribution_filename::WheelFilename;
use fromager_normalize::PackageName;

use crate::context::WorkContext;
use crate::error::BootstrapError;

/// Move freshly built wheels into the downloads pool and regenerate the
/// PEP 503 `simple/` tree from it. Serving the tree over HTTP is the
/// deployment's concern; the engine only keeps it current.
pub(crate) fn update_wheel_mirror(ctx: &WorkContext) -> Result<(), BootstrapError> {
    for entry in fs_err::read_dir(&ctx.wheels_build)? {
        let entry = entry?;
        let filename = entry.file_name().to_string_lossy().to_string();
        if !filename.ends_with(".whl") {
            continue;
        }
        let destination = ctx.wheels_downloads.join(&filename);
        debug!("moving built wheel {filename} into the mirror pool");
        fs_err::rename(entry.path(), destination)?;
    }
    generate_simple_index(&ctx.wheels_downloads, &ctx.wheel_server_dir)?;
    Ok(())
}

/// Write a PEP 503 index: `simple/index.html` plus one page per project
/// with sha256 fragments, pointing back into the downloads pool.
pub(crate) fn generate_simple_index(
    downloads_dir: &Path,
    simple_dir: &Path,
) -> Result<(), BootstrapError> {
    let mut projects: BTreeMap<PackageName, Vec<(String, String)>> = BTreeMap::new();
    for entry in fs_err::read_dir(downloads_dir)? {
        let entry = entry?;
        let filename = entry.file_name().to_string_lossy().to_string();
        let Ok(parsed) = filename.parse::<WheelFilename>() else {
            continue;
        };
        let digest = sha256_file(&entry.path())?;
        projects
            .entry(parsed.name.clone())
            .or_default()
            .push((filename, digest));
    }

    if simple_dir.exists() {
        fs_err::remove_dir_all(simple_dir)?;
    }
    fs_err::create_dir_all(simple_dir)?;

    let mut index = String::from("<!DOCTYPE html>\n<html>\n  <body>\n");
    for (project, files) in &projects {
        index.push_str(&format!(
            "    <a href=\"{project}/\">{project}</a><br/>\n"
        ));
        let project_dir = simple_dir.join(project.as_str());
        fs_err::create_dir_all(&project_dir)?;
        let mut page = format!(
            "<!DOCTYPE html>\n<html>\n  <body>\n    <h1>Links for {project}</h1>\n"
        );
        for (filename, digest) in files {
            page.push_str(&format!(
                "    <a href=\"../../downloads/{filename}#sha256={digest}\">{filename}</a><br/>\n"
            ));
        }
        page.push_str("  </body>\n</html>\n");
        fs_err::write(project_dir.join("index.html"), page)?;
    }
    index.push_str("  </body>\n</html>\n");
    fs_err::write(simple_dir.join("index.html"), index)?;
    info!("updated wheel mirror index with {} projects", projects.len());
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, BootstrapError> {
    let mut file = fs_err::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let count = file.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Remove pre-built wheels from the downloads pool so it only holds wheels
/// this run built, then refresh the index.
pub(crate) fn prune_prebuilt_from_downloads(ctx: &WorkContext) -> Result<(), BootstrapError> {
    let mut removed_any = false;
    for entry in fs_err::read_dir(&ctx.wheels_prebuilt)? {
        let entry = entry?;
        let filename = entry.file_name().to_string_lossy().to_string();
        if !filename.ends_with(".whl") {
            continue;
        }
        let pooled = ctx.wheels_downloads.join(&filename);
        if pooled.exists() {
            info!("removing prebuilt wheel {filename} from download cache");
            fs_err::remove_file(pooled)?;
            removed_any = true;
        }
    }
    if removed_any {
        generate_simple_index(&ctx.wheels_downloads, &ctx.wheel_server_dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_lists_wheels_by_project() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let downloads = dir.path().join("downloads");
        let simple = dir.path().join("simple");
        fs_err::create_dir_all(&downloads)?;
        fs_err::write(downloads.join("pbr-6.0.0-py3-none-any.whl"), "wheel-bytes")?;
        fs_err::write(downloads.join("not-a-wheel.txt"), "")?;

        generate_simple_index(&downloads, &simple)?;

        let index = fs_err::read_to_string(simple.join("index.html"))?;
        assert!(index.contains("<a href=\"pbr/\">pbr</a>"));
        let page = fs_err::read_to_string(simple.join("pbr/index.html"))?;
        assert!(page.contains("pbr-6.0.0-py3-none-any.whl#sha256="));
        Ok(())
    }
}
