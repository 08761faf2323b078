use std::path::Path;
use std::str::FromStr;

use indexmap::IndexMap;
use tracing::info;

use fromager_normalize::PackageName;
use fromager_pep440::Version;
use fromager_pep508::{evaluate_marker, MarkerEnvironment, Requirement};

use crate::requirements_file::parse_requirements_file;
use crate::SettingsError;

/// A pip-style constraints set: at most one requirement per package, applied
/// on top of every incoming requirement during resolution.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    data: IndexMap<PackageName, Requirement>,
}

impl Constraints {
    pub fn new(requirements: impl IntoIterator<Item = Requirement>) -> Self {
        let mut data = IndexMap::new();
        for requirement in requirements {
            data.insert(requirement.name.clone(), requirement);
        }
        Self { data }
    }

    /// Load a constraints file; `None` yields the empty set. Entries whose
    /// marker evaluates false are skipped.
    pub fn load(
        filename: Option<&Path>,
        env: &MarkerEnvironment,
    ) -> Result<Self, SettingsError> {
        let Some(filename) = filename else {
            return Ok(Self::default());
        };
        if !filename.exists() {
            return Err(SettingsError::MissingConstraintsFile(
                filename.to_path_buf(),
            ));
        }
        info!("loading constraints from {}", filename.display());
        let mut requirements = Vec::new();
        for line in parse_requirements_file(filename)? {
            let requirement = Requirement::from_str(&line).map_err(|err| {
                SettingsError::InvalidRequirement(
                    line.clone(),
                    filename.to_path_buf(),
                    err.to_string(),
                )
            })?;
            if evaluate_marker(env, &requirement, &requirement, &[]) {
                requirements.push(requirement);
            }
        }
        Ok(Self::new(requirements))
    }

    pub fn get_constraint(&self, name: &PackageName) -> Option<&Requirement> {
        self.data.get(name)
    }

    /// Whether a version is acceptable: unconstrained names always are;
    /// constrained names must match the constraint's specifiers, with
    /// pre-releases always admitted (the constraint itself is the opt-in).
    pub fn is_satisfied_by(&self, name: &PackageName, version: &Version) -> bool {
        match self.data.get(name) {
            Some(constraint) => constraint
                .specifiers
                .contains_with_prereleases(version, true),
            None => true,
        }
    }

    /// Whether the constraint for a name explicitly pins a pre-release.
    pub fn allow_prerelease(&self, name: &PackageName) -> bool {
        self.data
            .get(name)
            .is_some_and(|constraint| constraint.specifiers.prereleases_allowed())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PackageName, &Requirement)> {
        self.data.iter()
    }
}
