use std::path::Path;

use tracing::debug;

use crate::SettingsError;

/// Read a pip-style requirements file: one requirement per line, `#`
/// comments and blank lines stripped.
pub fn parse_requirements_file(req_file: &Path) -> Result<Vec<String>, SettingsError> {
    debug!("reading requirements file {}", req_file.display());
    let content = fs_err::read_to_string(req_file)?;
    Ok(parse_requirements_content(&content))
}

pub(crate) fn parse_requirements_content(content: &str) -> Vec<String> {
    let mut lines = Vec::new();
    for line in content.lines() {
        let useful = line.split('#').next().unwrap_or_default().trim();
        if useful.is_empty() {
            continue;
        }
        lines.push(useful.to_string());
    }
    lines
}
