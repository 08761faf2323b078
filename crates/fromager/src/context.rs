use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use tracing::{debug, info};

use fromager_build::{network_isolation_available, run_command, CommandOptions};
use fromager_client::{IndexClient, IndexClientBuilder};
use fromager_pep440::Version;
use fromager_pep508::{MarkerEnvironment, Requirement};
use fromager_platform_tags::Tags;
use fromager_settings::{Constraints, PackageBuildInfo, Settings};

/// The default URL of the local wheel mirror; serving the `simple/` tree is
/// the deployment's job, the engine only keeps the tree current.
const DEFAULT_WHEEL_SERVER_URL: &str = "http://localhost:8765/simple/";

pub(crate) struct WorkContextBuilder {
    pub work_dir: PathBuf,
    pub sdists_repo: PathBuf,
    pub wheels_repo: PathBuf,
    pub settings_file: PathBuf,
    pub settings_dir: PathBuf,
    pub patches_dir: PathBuf,
    pub constraints_file: Option<PathBuf>,
    pub variant: String,
    pub max_jobs: Option<u64>,
    pub python: String,
    pub cleanup: bool,
    pub network_isolation: bool,
    pub wheel_server_url: Option<String>,
}

impl WorkContextBuilder {
    pub(crate) fn build(self) -> Result<WorkContext> {
        if self.network_isolation && !network_isolation_available() {
            anyhow::bail!(
                "network isolation requires Linux with unshare; it is not available here"
            );
        }

        let python_version = probe_python_version(&self.python)?;
        debug!("building with {} ({python_version})", self.python);
        let marker_env = MarkerEnvironment::for_python(&python_version.to_string());
        let release = python_version.release();
        let tags = Tags::from_env((release[0] as u8, release.get(1).copied().unwrap_or(0) as u8))
            .context("unable to compute wheel tags for this host")?;

        let settings = Settings::from_files(
            &self.settings_file,
            &self.settings_dir,
            self.variant.clone(),
            self.patches_dir.clone(),
            self.max_jobs,
        )?;
        let constraints = Constraints::load(self.constraints_file.as_deref(), &marker_env)?;

        let context = WorkContext {
            work_dir: self.work_dir.clone(),
            sdists_downloads: self.sdists_repo.join("downloads"),
            sdists_builds: self.sdists_repo.join("builds"),
            wheels_build: self.wheels_repo.join("build"),
            wheels_downloads: self.wheels_repo.join("downloads"),
            wheels_prebuilt: self.wheels_repo.join("prebuilt"),
            wheel_server_dir: self.wheels_repo.join("simple"),
            settings,
            constraints,
            client: IndexClientBuilder::new().build(),
            tags,
            marker_env,
            python: self.python,
            python_version,
            cleanup: self.cleanup,
            network_isolation: self.network_isolation,
            wheel_server_url: self
                .wheel_server_url
                .unwrap_or_else(|| DEFAULT_WHEEL_SERVER_URL.to_string()),
        };
        context.create_dirs()?;
        Ok(context)
    }
}

fn probe_python_version(python: &str) -> Result<Version> {
    let output = run_command(
        &[
            python.to_string(),
            "-c".to_string(),
            "import platform; print(platform.python_version())".to_string(),
        ],
        &CommandOptions::default(),
    )
    .with_context(|| format!("unable to run {python}"))?;
    Version::from_str(output.trim())
        .with_context(|| format!("unable to parse python version from {output:?}"))
}

/// Everything one bootstrap run needs: directories, settings, constraints,
/// the HTTP client, and the host's Python view.
pub(crate) struct WorkContext {
    pub work_dir: PathBuf,
    pub sdists_downloads: PathBuf,
    pub sdists_builds: PathBuf,
    pub wheels_build: PathBuf,
    pub wheels_downloads: PathBuf,
    pub wheels_prebuilt: PathBuf,
    pub wheel_server_dir: PathBuf,
    pub settings: Settings,
    pub constraints: Constraints,
    pub client: IndexClient,
    pub tags: Tags,
    pub marker_env: MarkerEnvironment,
    pub python: String,
    pub python_version: Version,
    pub cleanup: bool,
    pub network_isolation: bool,
    pub wheel_server_url: String,
}

impl WorkContext {
    fn create_dirs(&self) -> Result<()> {
        for dir in [
            &self.work_dir,
            &self.sdists_downloads,
            &self.sdists_builds,
            &self.wheels_build,
            &self.wheels_downloads,
            &self.wheels_prebuilt,
            &self.wheel_server_dir,
        ] {
            fs_err::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub(crate) fn package_build_info(&self, req: &Requirement) -> PackageBuildInfo {
        self.settings.package_build_info(&req.name)
    }

    pub(crate) fn graph_file(&self) -> PathBuf {
        self.work_dir.join("graph.json")
    }

    pub(crate) fn build_order_file(&self) -> PathBuf {
        self.work_dir.join("build-order.json")
    }

    pub(crate) fn constraints_file(&self) -> PathBuf {
        self.work_dir.join("constraints.txt")
    }

    /// pip arguments pointing installs at the local wheel mirror.
    pub(crate) fn pip_wheel_server_args(&self) -> Vec<String> {
        vec!["--index-url".to_string(), self.wheel_server_url.clone()]
    }

    /// The per-package unpack dir, `<work_dir>/<name>-<version>`.
    pub(crate) fn unpack_dir(&self, req: &Requirement, version: &Version) -> PathBuf {
        let module = req.name.as_override_module_name().to_string();
        self.work_dir.join(format!("{module}-{version}"))
    }

    pub(crate) fn create_unpack_dir(
        &self,
        req: &Requirement,
        version: &Version,
    ) -> std::io::Result<PathBuf> {
        let unpack_dir = self.unpack_dir(req, version);
        fs_err::create_dir_all(&unpack_dir)?;
        Ok(unpack_dir)
    }

    pub(crate) fn cleanup_dir(&self, dir: &Path, what: &str) {
        if !self.cleanup || !dir.exists() {
            return;
        }
        debug!("cleaning up {what} {}", dir.display());
        if let Err(err) = fs_err::remove_dir_all(dir) {
            info!("failed to clean up {}: {err}", dir.display());
        }
    }
}
