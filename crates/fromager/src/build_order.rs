use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use fromager_normalize::PackageName;
use fromager_pep440::Version;
use fromager_pep508::Requirement;

use crate::error::BootstrapError;
use crate::sources::SourceKind;

/// One settled requirement in `build-order.json`, in the order downstream
/// builders must produce it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BuildOrderEntry {
    pub req: String,
    pub constraint: String,
    pub dist: String,
    pub version: String,
    pub prebuilt: bool,
    pub source_url: String,
    pub source_url_type: SourceKind,
}

/// The build-order accumulator: entries append in settlement order, deduped
/// by `(canonical_name, version)` — extras never create a second build of
/// the same wheel.
#[derive(Debug, Default)]
pub(crate) struct BuildOrder {
    entries: Vec<BuildOrderEntry>,
    recorded: HashSet<(PackageName, String)>,
}

impl BuildOrder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append an entry unless this `(name, version)` is already recorded.
    /// Returns whether the entry was added.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add(
        &mut self,
        req: &Requirement,
        version: &Version,
        source_url: &str,
        source_url_type: SourceKind,
        prebuilt: bool,
        constraint: Option<&Requirement>,
    ) -> bool {
        let key = (req.name.clone(), version.to_string());
        if self.recorded.contains(&key) {
            return false;
        }
        info!("{}: adding {}=={version} to build order", req.name, req.name);
        self.recorded.insert(key);
        self.entries.push(BuildOrderEntry {
            req: req.to_string(),
            constraint: constraint.map(ToString::to_string).unwrap_or_default(),
            dist: req.name.to_string(),
            version: version.to_string(),
            prebuilt,
            source_url: source_url.to_string(),
            source_url_type,
        });
        true
    }

    pub(crate) fn entries(&self) -> &[BuildOrderEntry] {
        &self.entries
    }

    /// Rewrite the build-order file; called after every addition so a
    /// crashing run leaves the settled prefix on disk.
    pub(crate) fn write_to_file(&self, path: &Path) -> Result<(), BootstrapError> {
        fs_err::write(path, serde_json::to_string_pretty(&self.entries)?)?;
        Ok(())
    }
}

pub(crate) fn load_build_order(path: &Path) -> Result<Vec<BuildOrderEntry>, BootstrapError> {
    let content = fs_err::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
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
    fn dedup_ignores_extras() {
        let mut order = BuildOrder::new();
        assert!(order.add(&req("pkg[a]"), &version("1.0"), "url", SourceKind::Sdist, false, None));
        assert!(!order.add(&req("pkg[b]"), &version("1.0"), "url", SourceKind::Sdist, false, None));
        assert!(order.add(&req("pkg"), &version("2.0"), "url", SourceKind::Sdist, false, None));
        assert_eq!(order.entries().len(), 2);
    }

    #[test]
    fn entry_schema() {
        let mut order = BuildOrder::new();
        let constraint = req("pkg<2");
        order.add(
            &req("pkg>=1"),
            &version("1.0"),
            "https://example.com/pkg-1.0.tar.gz",
            SourceKind::Sdist,
            false,
            Some(&constraint),
        );
        let json = serde_json::to_value(order.entries()).unwrap();
        let entry = &json[0];
        assert_eq!(entry["req"], "pkg>=1");
        assert_eq!(entry["constraint"], "pkg<2");
        assert_eq!(entry["dist"], "pkg");
        assert_eq!(entry["version"], "1.0");
        assert_eq!(entry["prebuilt"], false);
        assert_eq!(entry["source_url_type"], "sdist");
    }

    #[test]
    fn file_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("build-order.json");
        let mut order = BuildOrder::new();
        order.add(&req("a"), &version("1"), "u", SourceKind::Prebuilt, true, None);
        order.write_to_file(&path)?;
        let loaded = load_build_order(&path)?;
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].prebuilt);
        assert_eq!(loaded[0].source_url_type, SourceKind::Prebuilt);
        Ok(())
    }
}
