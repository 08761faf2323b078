use std::path::Path;
use std::process::{Command, Stdio};

use tracing::info;

use crate::BuildError;

/// Apply one patch file with `patch -p1` inside `source_root_dir`. A patch
/// that does not apply is fatal.
pub fn apply_patch(patch: &Path, source_root_dir: &Path) -> Result<(), BuildError> {
    info!(
        "applying patch file {} to {}",
        patch.display(),
        source_root_dir.display()
    );
    let patch_file = fs_err::File::open(patch)?;
    let output = Command::new("patch")
        .args(["-p1"])
        .current_dir(source_root_dir)
        .stdin(Stdio::from(patch_file.into_parts().0))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()?;
    if !output.status.success() {
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        return Err(BuildError::PatchFailed {
            patch: patch.to_path_buf(),
            output_tail: combined.trim().to_string(),
        });
    }
    Ok(())
}
