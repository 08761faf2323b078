use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use fromager_pep440::Version;
use fromager_pep508::Requirement;

/// Hook points a package override may claim. Every slot is optional; the
/// engine falls back to its default behavior for empty slots.
///
/// The registry is a closed, static map keyed by override module name.
/// There is no runtime module discovery: adding an override means adding an
/// entry to [`registry`].
#[derive(Default)]
pub(crate) struct OverrideHooks {
    /// Produce the expected sdist filename in the downloads directory.
    pub expected_source_archive_name: Option<fn(&Requirement, &Version) -> String>,
    /// Produce the expected unpacked source directory name.
    pub expected_source_directory_name: Option<fn(&Requirement, &Version) -> String>,
    /// Replace the default source download with a custom one; returns the
    /// downloaded file.
    pub download_source: Option<fn(&Requirement, &Version, &str) -> Option<PathBuf>>,
    /// Replace the default source resolution with a custom `(url, version)`.
    pub resolve_source: Option<fn(&Requirement) -> Option<(String, Version)>>,
    /// Post-build notification, e.g. for collecting vendor artifacts.
    pub post_build: Option<fn(&Requirement, &Version, &PathBuf)>,
}

fn registry() -> &'static HashMap<&'static str, OverrideHooks> {
    static REGISTRY: OnceLock<HashMap<&'static str, OverrideHooks>> = OnceLock::new();
    REGISTRY.get_or_init(HashMap::new)
}

/// Look up the hook table for an override module name.
pub(crate) fn find_override(override_module_name: &str) -> Option<&'static OverrideHooks> {
    registry().get(override_module_name)
}

/// Whether the package claims any source-acquisition hook; such packages
/// are recorded with `source_url_type = "override"`.
pub(crate) fn has_source_override(override_module_name: &str) -> bool {
    find_override(override_module_name)
        .map(|hooks| hooks.download_source.is_some() || hooks.resolve_source.is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_module_has_no_hooks() {
        assert!(find_override("no_such_module").is_none());
        assert!(!has_source_override("no_such_module"));
    }
}
