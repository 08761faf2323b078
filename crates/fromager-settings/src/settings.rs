use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use fromager_distribution_filename::BuildTag;
use fromager_normalize::PackageName;
use fromager_pep440::Version;

use crate::package::PackageSettings;
use crate::template;
use crate::SettingsError;

/// The global settings file, `settings.yaml`.
///
/// ```yaml
/// changelog:
///   cuda:
///     - "2024-09-13: updated CUDA version"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub changelog: IndexMap<String, Vec<String>>,
    // Legacy keys, accepted and ignored.
    #[serde(default, skip_serializing)]
    pre_built: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing)]
    packages: Option<serde_yaml::Value>,
}

impl SettingsFile {
    pub fn from_string(raw_yaml: &str, source: Option<&Path>) -> Result<Self, SettingsError> {
        if raw_yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw_yaml).map_err(|err| SettingsError::InvalidGlobalSettings {
            source_path: source.map(Path::to_path_buf),
            err,
        })
    }

    pub fn from_file(filename: &Path) -> Result<Self, SettingsError> {
        tracing::info!("loading settings from {}", filename.display());
        let raw_yaml = fs_err::read_to_string(filename)?;
        Self::from_string(&raw_yaml, Some(filename))
    }
}

/// Process-wide settings: the global changelog, the package-settings map,
/// the active variant, the job limit, and the patches root.
#[derive(Debug)]
pub struct Settings {
    settings: SettingsFile,
    package_settings: IndexMap<PackageName, PackageSettings>,
    variant: String,
    patches_dir: PathBuf,
    max_jobs: Option<u64>,
}

impl Settings {
    pub fn new(
        settings: SettingsFile,
        package_settings: IndexMap<PackageName, PackageSettings>,
        variant: impl Into<String>,
        patches_dir: PathBuf,
        max_jobs: Option<u64>,
    ) -> Self {
        Self {
            settings,
            package_settings,
            variant: variant.into(),
            patches_dir,
            max_jobs,
        }
    }

    /// Load `settings.yaml` plus every `<settings_dir>/*.yaml`.
    pub fn from_files(
        settings_file: &Path,
        settings_dir: &Path,
        variant: impl Into<String>,
        patches_dir: PathBuf,
        max_jobs: Option<u64>,
    ) -> Result<Self, SettingsError> {
        let settings = if settings_file.is_file() {
            SettingsFile::from_file(settings_file)?
        } else {
            debug!(
                "settings file {} does not exist, ignoring",
                settings_file.display()
            );
            SettingsFile::default()
        };
        let mut package_settings = IndexMap::new();
        if settings_dir.is_dir() {
            let mut files: Vec<PathBuf> = fs_err::read_dir(settings_dir)?
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "yaml"))
                .collect();
            files.sort();
            for file in files {
                let (package, parsed) = PackageSettings::from_file(&file)?;
                package_settings.insert(package, parsed);
            }
        }
        Ok(Self::new(
            settings,
            package_settings,
            variant,
            patches_dir,
            max_jobs,
        ))
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    pub fn max_jobs(&self) -> Option<u64> {
        self.max_jobs
    }

    pub fn patches_dir(&self) -> &Path {
        &self.patches_dir
    }

    /// The global changelog entries for the active variant.
    pub fn variant_changelog(&self) -> Vec<String> {
        self.settings
            .changelog
            .get(&self.variant)
            .cloned()
            .unwrap_or_default()
    }

    /// Settings for a package; defaults when no file was configured.
    pub fn package_setting(&self, package: &PackageName) -> PackageSettings {
        self.package_settings
            .get(package)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_config(&self, package: &PackageName) -> bool {
        self.package_settings.contains_key(package)
    }

    /// The resolved build view for one package under the active variant.
    pub fn package_build_info(&self, package: &PackageName) -> PackageBuildInfo {
        PackageBuildInfo {
            package: package.clone(),
            variant: self.variant.clone(),
            variant_changelog_len: self.variant_changelog().len() as u64,
            patches_dir: self.patches_dir.clone(),
            max_jobs: self.max_jobs,
            settings: self.package_setting(package),
        }
    }

    /// Packages marked pre-built for the active variant.
    pub fn list_pre_built(&self) -> Vec<PackageName> {
        self.package_settings
            .keys()
            .filter(|package| self.package_build_info(package).pre_built(None))
            .cloned()
            .collect()
    }

    /// Packages with any override: a settings file or a patch directory.
    pub fn list_overrides(&self) -> Result<Vec<PackageName>, SettingsError> {
        let mut packages: Vec<PackageName> = self.package_settings.keys().cloned().collect();
        if self.patches_dir.is_dir() {
            for entry in fs_err::read_dir(&self.patches_dir)? {
                let entry = entry?;
                let dirname = entry.file_name().to_string_lossy().to_string();
                // Patch directories are named `<module>-<version>`.
                if let Some((module, _version)) = dirname.rsplit_once('-') {
                    if let Ok(package) = PackageName::new(module) {
                        if !packages.contains(&package) {
                            packages.push(package);
                        }
                    }
                }
            }
        }
        packages.sort();
        Ok(packages)
    }
}

/// The per-package, per-variant view the engine consults: pre-built policy,
/// build tag, env composition, patches, and resolver configuration.
#[derive(Debug, Clone)]
pub struct PackageBuildInfo {
    package: PackageName,
    variant: String,
    variant_changelog_len: u64,
    patches_dir: PathBuf,
    max_jobs: Option<u64>,
    settings: PackageSettings,
}

impl PackageBuildInfo {
    pub fn package(&self) -> &PackageName {
        &self.package
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    pub fn override_module_name(&self) -> String {
        self.package.as_override_module_name().to_string()
    }

    pub fn settings(&self) -> &PackageSettings {
        &self.settings
    }

    /// Whether this package resolves to a pre-built wheel, checking the
    /// version-specific refinement before the variant flag.
    pub fn pre_built(&self, version: Option<&Version>) -> bool {
        let Some(variant_info) = self.settings.variants.get(&self.variant) else {
            return false;
        };
        if let Some(version) = version {
            if let Some(version_info) = variant_info.versions.get(version) {
                if let Some(pre_built) = version_info.pre_built {
                    return pre_built;
                }
            }
        }
        variant_info.pre_built
    }

    /// Alternative wheel index for pre-built wheels, version-specific
    /// entries first.
    pub fn wheel_server_url(&self, version: Option<&Version>) -> Option<String> {
        let variant_info = self.settings.variants.get(&self.variant)?;
        if let Some(version) = version {
            if let Some(version_info) = variant_info.versions.get(version) {
                if version_info.wheel_server_url.is_some() {
                    return version_info.wheel_server_url.clone();
                }
            }
        }
        variant_info.wheel_server_url.clone()
    }

    /// The build tag for a version: the count of its changelog entries plus
    /// the variant changelog's, with an empty suffix. Zero entries means no
    /// build tag.
    pub fn build_tag(&self, version: &Version) -> Option<BuildTag> {
        let release = self.settings.changelog.get(version).map_or(0, Vec::len) as u64
            + self.variant_changelog_len;
        if release == 0 {
            None
        } else {
            Some(BuildTag::new(release, None))
        }
    }

    pub fn changelog(&self, version: &Version) -> Vec<String> {
        self.settings
            .changelog
            .get(version)
            .cloned()
            .unwrap_or_default()
    }

    /// The templated sdist download URL, if configured.
    pub fn download_source_url(
        &self,
        version: Option<&Version>,
        default: Option<&str>,
    ) -> Result<Option<String>, SettingsError> {
        self.resolve_template(self.settings.download_source.url.as_deref(), version, default)
    }

    /// The templated destination filename, if configured.
    pub fn download_source_destination_filename(
        &self,
        version: Option<&Version>,
        default: Option<&str>,
    ) -> Result<Option<String>, SettingsError> {
        self.resolve_template(
            self.settings.download_source.destination_filename.as_deref(),
            version,
            default,
        )
    }

    /// Whether the package configures its own source download.
    pub fn has_download_source(&self) -> bool {
        self.settings.download_source.url.is_some()
    }

    fn resolve_template(
        &self,
        template: Option<&str>,
        version: Option<&Version>,
        default: Option<&str>,
    ) -> Result<Option<String>, SettingsError> {
        let Some(template) = template.or(default) else {
            return Ok(None);
        };
        let mut values = IndexMap::from([(
            "canonicalized_name".to_string(),
            self.package.to_string(),
        )]);
        if let Some(version) = version {
            values.insert("version".to_string(), version.to_string());
        }
        template::substitute(template, &values).map(Some)
    }

    pub fn resolver_sdist_server_url<'a>(&'a self, default: &'a str) -> &'a str {
        self.settings
            .resolver_dist
            .sdist_server_url
            .as_deref()
            .unwrap_or(default)
    }

    pub fn resolver_include_sdists(&self) -> bool {
        self.settings.resolver_dist.include_sdists
    }

    pub fn resolver_include_wheels(&self) -> bool {
        self.settings.resolver_dist.include_wheels
    }

    /// The build directory inside an unpacked source tree.
    pub fn build_dir(&self, sdist_root_dir: &Path) -> PathBuf {
        match &self.settings.build_dir {
            Some(build_dir) => sdist_root_dir.join(build_dir),
            None => sdist_root_dir.to_path_buf(),
        }
    }

    pub fn build_ext_parallel(&self) -> bool {
        self.settings.build_options.build_ext_parallel
    }

    pub fn project_override(&self) -> &crate::ProjectOverride {
        &self.settings.project_override
    }

    /// Patches for every version of this package: the lexicographically
    /// sorted contents of `patches/<override_name>-<version>/*.patch`.
    pub fn get_patches(&self) -> Result<IndexMap<Version, Vec<PathBuf>>, SettingsError> {
        let mut patches = IndexMap::new();
        if !self.patches_dir.is_dir() {
            return Ok(patches);
        }
        let prefix = format!("{}-", self.override_module_name());
        let mut dirs: Vec<PathBuf> = fs_err::read_dir(&self.patches_dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();
        for dir in dirs {
            let dirname = dir.file_name().and_then(|name| name.to_str()).unwrap_or("");
            let Some(version_str) = dirname.strip_prefix(&prefix) else {
                continue;
            };
            let Ok(version) = version_str.parse::<Version>() else {
                continue;
            };
            let mut files: Vec<PathBuf> = fs_err::read_dir(&dir)?
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "patch"))
                .collect();
            files.sort();
            patches.insert(version, files);
        }
        Ok(patches)
    }

    /// Patches for one version; missing directory means none.
    pub fn patches(&self, version: &Version) -> Result<Vec<PathBuf>, SettingsError> {
        Ok(self.get_patches()?.shift_remove(version).unwrap_or_default())
    }

    /// Compose extra env vars: common entries, then variant entries, then
    /// (when a version is given) version-specific entries. Each value is
    /// `$VAR`-substituted against a copy of `template_env` that grows with
    /// every resolved entry, so later entries can reference earlier ones.
    pub fn get_extra_environ(
        &self,
        template_env: &IndexMap<String, String>,
        version: Option<&Version>,
    ) -> Result<IndexMap<String, String>, SettingsError> {
        let mut template_env = template_env.clone();
        let mut entries: Vec<(String, String)> = self
            .settings
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(variant_info) = self.settings.variants.get(&self.variant) {
            entries.extend(variant_info.env.iter().map(|(k, v)| (k.clone(), v.clone())));
            if let Some(version) = version {
                if let Some(version_info) = variant_info.versions.get(version) {
                    entries.extend(
                        version_info.env.iter().map(|(k, v)| (k.clone(), v.clone())),
                    );
                }
            }
        }

        let mut extra_environ = IndexMap::new();
        for (key, value) in entries {
            let value = template::substitute(&value, &template_env)?;
            extra_environ.insert(key.clone(), value.clone());
            template_env.insert(key, value);
        }
        Ok(extra_environ)
    }

    /// The parallel job count: CPU cores and free memory divided by the
    /// per-job costs, clamped by `max_jobs`, floor 1.
    pub fn parallel_jobs(&self) -> u64 {
        let cpu_count = cpu_count();
        let cpu_cores_per_job = self.settings.build_options.cpu_cores_per_job.max(1);
        let max_num_job_cores = (cpu_count / cpu_cores_per_job).max(1);

        let memory_per_job_gb = self.settings.build_options.memory_per_job_gb.max(0.1);
        let free_memory_gib = available_memory_gib();
        let max_num_jobs_memory = ((free_memory_gib / memory_per_job_gb).floor() as u64).max(1);

        let max_jobs = self.max_jobs.unwrap_or(cpu_count);
        let parallel_builds = max_num_job_cores
            .min(max_num_jobs_memory)
            .min(max_jobs)
            .max(1);

        debug!(
            "{}: parallel builds {parallel_builds} ({free_memory_gib:.1} GiB free, \
             {cpu_count} cores, max_jobs {max_jobs})",
            self.package
        );
        parallel_builds
    }
}

fn cpu_count() -> u64 {
    sys_info::cpu_num().map(u64::from).unwrap_or(1).max(1)
}

fn available_memory_gib() -> f64 {
    sys_info::mem_info()
        .map(|info| info.avail as f64 / (1024.0 * 1024.0))
        .unwrap_or(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> PackageName {
        PackageName::new(s).unwrap()
    }

    fn version(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn settings_with(package_yaml: &str, global_yaml: &str, variant: &str) -> Settings {
        let package = PackageSettings::from_string(&name("egg"), package_yaml, None).unwrap();
        let global = SettingsFile::from_string(global_yaml, None).unwrap();
        Settings::new(
            global,
            IndexMap::from([(name("egg"), package)]),
            variant,
            PathBuf::from("/nonexistent-patches"),
            None,
        )
    }

    #[test]
    fn build_tag_counts_changelogs() {
        let settings = settings_with(
            "changelog:\n  \"1.0.1\":\n    - fix one\n    - fix two\n",
            "changelog:\n  cpu:\n    - rebuilt world\n",
            "cpu",
        );
        let pbi = settings.package_build_info(&name("egg"));
        assert_eq!(
            pbi.build_tag(&version("1.0.1")),
            Some(BuildTag::new(3, None))
        );
        // Only the variant changelog applies to other versions.
        assert_eq!(
            pbi.build_tag(&version("2.0")),
            Some(BuildTag::new(1, None))
        );
    }

    #[test]
    fn build_tag_empty_when_no_changelog() {
        let settings = settings_with("", "", "cpu");
        let pbi = settings.package_build_info(&name("egg"));
        assert_eq!(pbi.build_tag(&version("1.0")), None);
    }

    #[test]
    fn pre_built_per_variant() {
        let settings = settings_with("variants:\n  rocm:\n    pre_built: true\n", "", "rocm");
        assert!(settings.package_build_info(&name("egg")).pre_built(None));
        let settings = settings_with("variants:\n  rocm:\n    pre_built: true\n", "", "cpu");
        assert!(!settings.package_build_info(&name("egg")).pre_built(None));
    }

    #[test]
    fn version_specific_pre_built() {
        let yaml = r#"
variants:
  tpu-ubi9:
    pre_built: false
    versions:
      "2.9.0.dev20250730":
        pre_built: true
        wheel_server_url: https://prebuilt.example.com/simple/
"#;
        let settings = settings_with(yaml, "", "tpu-ubi9");
        let pbi = settings.package_build_info(&name("egg"));
        let dev = version("2.9.0.dev20250730");
        assert!(pbi.pre_built(Some(&dev)));
        assert_eq!(
            pbi.wheel_server_url(Some(&dev)).as_deref(),
            Some("https://prebuilt.example.com/simple/")
        );
        assert!(!pbi.pre_built(Some(&version("2.8.0"))));
        assert_eq!(pbi.wheel_server_url(Some(&version("2.8.0"))), None);
    }

    #[test]
    fn env_composition_chains() {
        let yaml = r#"
env:
  BASE: /opt
  PATHISH: $BASE/bin
variants:
  cpu:
    env:
      FULL: $PATHISH/tool
"#;
        let settings = settings_with(yaml, "", "cpu");
        let pbi = settings.package_build_info(&name("egg"));
        let environ = pbi.get_extra_environ(&IndexMap::new(), None).unwrap();
        assert_eq!(environ.get("PATHISH").unwrap(), "/opt/bin");
        assert_eq!(environ.get("FULL").unwrap(), "/opt/bin/tool");
    }

    #[test]
    fn env_composition_reads_template_env() {
        let yaml = "env:\n  WITH_HOME: $HOME/x\n";
        let settings = settings_with(yaml, "", "cpu");
        let pbi = settings.package_build_info(&name("egg"));
        let template = IndexMap::from([("HOME".to_string(), "/home/me".to_string())]);
        let environ = pbi.get_extra_environ(&template, None).unwrap();
        assert_eq!(environ.get("WITH_HOME").unwrap(), "/home/me/x");
    }

    #[test]
    fn download_url_template() {
        let yaml = "download_source:\n  url: https://egg.test/${canonicalized_name}-${version}.tar.gz\n";
        let settings = settings_with(yaml, "", "cpu");
        let pbi = settings.package_build_info(&name("egg"));
        assert_eq!(
            pbi.download_source_url(Some(&version("1.2")), None)
                .unwrap()
                .as_deref(),
            Some("https://egg.test/egg-1.2.tar.gz")
        );
    }

    #[test]
    fn unresolved_template_errors() {
        let yaml = "download_source:\n  url: https://egg.test/${version}.tar.gz\n";
        let settings = settings_with(yaml, "", "cpu");
        let pbi = settings.package_build_info(&name("egg"));
        assert!(pbi.download_source_url(None, None).is_err());
    }

    #[test]
    fn parallel_jobs_bounds() {
        let settings = settings_with("", "", "cpu");
        let pbi = settings.package_build_info(&name("egg"));
        let jobs = pbi.parallel_jobs();
        assert!(jobs >= 1);
        assert!(jobs <= cpu_count());
    }

    #[test]
    fn parallel_jobs_respects_max_jobs() {
        let package = PackageSettings::default();
        let settings = Settings::new(
            SettingsFile::default(),
            IndexMap::from([(name("egg"), package)]),
            "cpu",
            PathBuf::from("/nonexistent"),
            Some(1),
        );
        assert_eq!(settings.package_build_info(&name("egg")).parallel_jobs(), 1);
    }

    #[test]
    fn patches_missing_dir_is_empty() {
        let settings = settings_with("", "", "cpu");
        let pbi = settings.package_build_info(&name("egg"));
        assert!(pbi.patches(&version("1.0")).unwrap().is_empty());
    }

    #[test]
    fn patches_sorted() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let patch_dir = dir.path().join("egg-1.0");
        fs_err::create_dir_all(&patch_dir)?;
        fs_err::write(patch_dir.join("002-second.patch"), "")?;
        fs_err::write(patch_dir.join("001-first.patch"), "")?;
        fs_err::write(patch_dir.join("notes.txt"), "")?;

        let package = PackageSettings::default();
        let settings = Settings::new(
            SettingsFile::default(),
            IndexMap::from([(name("egg"), package)]),
            "cpu",
            dir.path().to_path_buf(),
            None,
        );
        let patches = settings
            .package_build_info(&name("egg"))
            .patches(&version("1.0"))?;
        assert_eq!(patches.len(), 2);
        assert!(patches[0].ends_with("001-first.patch"));
        assert!(patches[1].ends_with("002-second.patch"));
        Ok(())
    }

    #[test]
    fn legacy_global_keys_ignored() {
        let global = SettingsFile::from_string("pre_built:\n  cuda:\n    - torch\n", None);
        assert!(global.is_ok());
    }
}
