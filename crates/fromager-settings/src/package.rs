use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use indexmap::IndexMap;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};

use fromager_normalize::PackageName;
use fromager_pep440::Version;
use fromager_pep508::Requirement;

use crate::SettingsError;

/// Environment variables from a settings file. Scalar values (ints, floats,
/// bools) are coerced to strings on load; `$()` subshells are rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvVars(pub IndexMap<String, String>);

impl EnvVars {
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for EnvVars {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EnvVarsVisitor;

        impl<'de> Visitor<'de> for EnvVarsVisitor {
            type Value = EnvVars;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of environment variables")
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(EnvVars::default())
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                #[derive(Deserialize)]
                #[serde(untagged)]
                enum Scalar {
                    Bool(bool),
                    Int(i64),
                    Float(f64),
                    Str(String),
                }

                let mut vars = IndexMap::new();
                while let Some((key, value)) = map.next_entry::<String, Scalar>()? {
                    let value = match value {
                        Scalar::Bool(true) => "1".to_string(),
                        Scalar::Bool(false) => "0".to_string(),
                        Scalar::Int(number) => number.to_string(),
                        Scalar::Float(number) => number.to_string(),
                        Scalar::Str(string) => string.trim().to_string(),
                    };
                    if value.contains("$(") {
                        return Err(de::Error::custom(
                            SettingsError::SubshellInEnv(value).to_string(),
                        ));
                    }
                    vars.insert(key, value);
                }
                Ok(EnvVars(vars))
            }
        }

        deserializer.deserialize_any(EnvVarsVisitor)
    }
}

/// Where to resolve distribution versions for a package.
///
/// ```yaml
/// sdist_server_url: https://pypi.org/simple/
/// include_sdists: true
/// include_wheels: false
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ResolverDist {
    /// Source distribution download server (default: PyPI).
    pub sdist_server_url: Option<String>,
    /// Use sdists to resolve? (default: yes)
    #[serde(default = "default_true")]
    pub include_sdists: bool,
    /// Use wheels to resolve? (default: no)
    pub include_wheels: bool,
}

fn default_true() -> bool {
    true
}

/// Download package sources from an alternative source, e.g. a GitHub
/// release.
///
/// ```yaml
/// url: https://example.com/${canonicalized_name}-${version}.tar.gz
/// destination_filename: ${canonicalized_name}-${version}.tar.gz
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DownloadSource {
    /// Source download URL (string template).
    pub url: Option<String>,
    /// Rename the downloaded file (filename without path).
    pub destination_filename: Option<String>,
}

/// Build system options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BuildOptions {
    /// Configure `build_ext[parallel]` for setuptools extension builds.
    /// Incompatible with some packages, e.g. numba 0.60.0.
    pub build_ext_parallel: bool,
    /// Cores allocated to one build job when scaling parallelism.
    pub cpu_cores_per_job: u64,
    /// Virtual memory (GiB, without swap) assumed per build job.
    pub memory_per_job_gb: f64,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            build_ext_parallel: false,
            cpu_cores_per_job: 1,
            memory_per_job_gb: 1.0,
        }
    }
}

/// Overrides for `pyproject.toml` `[build-system] requires`.
///
/// ```yaml
/// update_build_requires:
///   - setuptools
/// remove_build_requires:
///   - ninja
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProjectOverride {
    /// Add / update requirements in `[build-system] requires`.
    #[serde(deserialize_with = "validated_requirement_strings", default)]
    pub update_build_requires: Vec<String>,
    /// Remove requirements from `[build-system] requires`.
    pub remove_build_requires: Vec<PackageName>,
}

fn validated_requirement_strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<String>::deserialize(deserializer)?;
    for entry in &raw {
        Requirement::from_str(entry).map_err(de::Error::custom)?;
    }
    Ok(raw)
}

/// Per-version refinement of a variant, consulted before the variant-level
/// flags (used for packages that publish pre-built wheels only for some
/// versions).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct VariantVersionInfo {
    pub pre_built: Option<bool>,
    pub wheel_server_url: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub env: EnvVars,
}

/// Variant configuration for a package.
///
/// ```yaml
/// env:
///   VAR1: "value 1"
/// wheel_server_url: https://pypi.org/simple/
/// pre_built: false
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct VariantInfo {
    /// Additional env vars (override package env vars).
    #[serde(deserialize_with = "null_as_default")]
    pub env: EnvVars,
    /// Alternative package index for pre-built wheels.
    pub wheel_server_url: Option<String>,
    /// Use pre-built wheels from an index server?
    pub pre_built: bool,
    /// Per-version overrides of the above.
    #[serde(deserialize_with = "null_as_default")]
    pub versions: IndexMap<Version, VariantVersionInfo>,
}

/// Immutable per-package configuration, loaded from
/// `<settings_dir>/<override_module_name>.yaml`. A missing file yields the
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PackageSettings {
    /// Sub-directory containing `setup.py` / `pyproject.toml`; must be
    /// relative.
    pub build_dir: Option<PathBuf>,
    /// Changelog entries per version; the entry count feeds the build tag.
    #[serde(deserialize_with = "null_as_default")]
    pub changelog: IndexMap<Version, Vec<String>>,
    /// Env vars common to all variants.
    #[serde(deserialize_with = "null_as_default")]
    pub env: EnvVars,
    /// Alternative source download settings.
    #[serde(deserialize_with = "null_as_default")]
    pub download_source: DownloadSource,
    /// Distribution resolution policy.
    #[serde(deserialize_with = "null_as_default")]
    pub resolver_dist: ResolverDist,
    /// Build system options.
    #[serde(deserialize_with = "null_as_default")]
    pub build_options: BuildOptions,
    /// `pyproject.toml` mutations.
    #[serde(deserialize_with = "null_as_default")]
    pub project_override: ProjectOverride,
    /// Variant configuration.
    #[serde(deserialize_with = "null_as_default")]
    pub variants: IndexMap<String, VariantInfo>,
}

/// Accept an explicit `null` where the original settings files use an empty
/// section header.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl PackageSettings {
    /// Parse from a YAML string.
    pub fn from_string(
        package: &PackageName,
        raw_yaml: &str,
        source: Option<&Path>,
    ) -> Result<Self, SettingsError> {
        let settings: Self = serde_yaml::from_str(raw_yaml).map_err(|err| {
            SettingsError::InvalidPackageSettings {
                package: package.to_string(),
                source_path: source.map(Path::to_path_buf),
                err,
            }
        })?;
        if let Some(build_dir) = &settings.build_dir {
            if build_dir.is_absolute() {
                return Err(SettingsError::AbsoluteBuildDir(build_dir.clone()));
            }
        }
        Ok(settings)
    }

    /// Load from a file; the package name is taken from the file stem.
    pub fn from_file(filename: &Path) -> Result<(PackageName, Self), SettingsError> {
        tracing::debug!("loading package config from {}", filename.display());
        let stem = filename
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default();
        let package = PackageName::new(stem)?;
        let raw_yaml = fs_err::read_to_string(filename)?;
        let settings = Self::from_string(&package, &raw_yaml, Some(filename))?;
        Ok((package, settings))
    }

    /// Serialize back to YAML (used by the settings linter and tests).
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> PackageName {
        PackageName::new(s).unwrap()
    }

    const FULL: &str = r#"
build_dir: python
changelog:
  "1.0.1":
    - fixed bug
env:
  EGG: spam
  COUNT: 3
  FLAG: true
download_source:
  url: https://egg.test/${canonicalized_name}-${version}.tar.gz
  destination_filename: ${canonicalized_name}-${version}.tar.gz
resolver_dist:
  sdist_server_url: https://sdist.test/egg
  include_sdists: true
  include_wheels: false
variants:
  cpu:
    env:
      EGG: spamalot
    wheel_server_url: https://wheel.test/simple
  rocm:
    pre_built: true
"#;

    #[test]
    fn parse_full() {
        let settings = PackageSettings::from_string(&name("egg"), FULL, None).unwrap();
        assert_eq!(settings.build_dir.as_deref(), Some(Path::new("python")));
        assert_eq!(settings.env.0.get("EGG").unwrap(), "spam");
        assert_eq!(settings.env.0.get("COUNT").unwrap(), "3");
        assert_eq!(settings.env.0.get("FLAG").unwrap(), "1");
        assert!(settings.variants.get("rocm").unwrap().pre_built);
        assert!(!settings.variants.get("cpu").unwrap().pre_built);
    }

    #[test]
    fn unknown_keys_rejected() {
        let err = PackageSettings::from_string(&name("egg"), "no_such_key: 1", None);
        assert!(err.is_err());
    }

    #[test]
    fn empty_file_is_default() {
        let settings = PackageSettings::from_string(&name("egg"), "", None).unwrap();
        assert_eq!(settings, PackageSettings::default());
    }

    #[test]
    fn null_sections_are_default() {
        let settings =
            PackageSettings::from_string(&name("egg"), "download_source:\nvariants:\n", None)
                .unwrap();
        assert_eq!(settings.download_source, DownloadSource::default());
    }

    #[test]
    fn absolute_build_dir_rejected() {
        let err = PackageSettings::from_string(&name("egg"), "build_dir: /abs", None);
        assert!(matches!(err, Err(SettingsError::AbsoluteBuildDir(_))));
    }

    #[test]
    fn subshell_rejected() {
        let err = PackageSettings::from_string(&name("egg"), "env:\n  X: $(uname)\n", None);
        assert!(err.is_err());
    }

    #[test]
    fn invalid_update_build_requires_rejected() {
        let err = PackageSettings::from_string(
            &name("egg"),
            "project_override:\n  update_build_requires:\n    - 'not a req=='\n",
            None,
        );
        assert!(err.is_err());
    }

    #[test]
    fn version_specific_variant_info() {
        let yaml = r#"
variants:
  tpu-ubi9:
    pre_built: false
    versions:
      "2.9.0.dev20250730":
        pre_built: true
        wheel_server_url: https://prebuilt.example.com/simple/
"#;
        let settings = PackageSettings::from_string(&name("pkg"), yaml, None).unwrap();
        let variant = settings.variants.get("tpu-ubi9").unwrap();
        let version: Version = "2.9.0.dev20250730".parse().unwrap();
        assert_eq!(variant.versions.get(&version).unwrap().pre_built, Some(true));
    }

    #[test]
    fn yaml_round_trip() {
        let settings = PackageSettings::from_string(&name("egg"), FULL, None).unwrap();
        let dumped = settings.to_yaml().unwrap();
        let reparsed = PackageSettings::from_string(&name("egg"), &dumped, None).unwrap();
        assert_eq!(settings, reparsed);
    }
}
