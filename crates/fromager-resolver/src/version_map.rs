use std::collections::BTreeMap;

use fromager_pep440::Version;
use fromager_pep508::Requirement;

use crate::ResolverError;

/// An ordered map from version to arbitrary data, the lookup helper plugin
/// overrides use to associate download URLs (or anything else) with the
/// versions they support.
#[derive(Debug, Clone, Default)]
pub struct VersionMap<T> {
    content: BTreeMap<Version, T>,
}

impl<T> VersionMap<T> {
    pub fn new() -> Self {
        Self {
            content: BTreeMap::new(),
        }
    }

    /// Associate a value with a version.
    pub fn add(&mut self, version: Version, value: T) {
        self.content.insert(version, value);
    }

    /// The known versions, in descending order.
    pub fn versions(&self) -> impl Iterator<Item = &Version> {
        self.content.keys().rev()
    }

    /// The highest version matching the requirement and optional
    /// constraint, with its value.
    pub fn lookup(
        &self,
        requirement: &Requirement,
        constraint: Option<&Requirement>,
        allow_prerelease: bool,
    ) -> Result<(&Version, &T), ResolverError> {
        for (version, value) in self.content.iter().rev() {
            if !requirement
                .specifiers
                .contains_with_prereleases(version, allow_prerelease)
            {
                continue;
            }
            if let Some(constraint) = constraint {
                if !constraint
                    .specifiers
                    .contains_with_prereleases(version, allow_prerelease)
                {
                    continue;
                }
            }
            return Ok((version, value));
        }
        Err(ResolverError::impossible(
            format!(
                "{requirement} with constraint {}",
                constraint.map_or_else(|| "<none>".to_string(), ToString::to_string)
            ),
            self.content.keys().map(ToString::to_string).collect(),
        ))
    }
}

impl<T> FromIterator<(Version, T)> for VersionMap<T> {
    fn from_iter<I: IntoIterator<Item = (Version, T)>>(iter: I) -> Self {
        Self {
            content: iter.into_iter().collect(),
        }
    }
}
