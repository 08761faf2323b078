use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use fromager_pep508::Requirement;

use crate::commands::{run_command, CommandOptions};
use crate::BuildError;

/// A virtualenv used for build isolation, created under the unpack
/// directory of the package being built and reused across retries.
#[derive(Debug)]
pub struct BuildEnvironment {
    path: PathBuf,
    python: PathBuf,
}

impl BuildEnvironment {
    /// Create (or reuse) the build environment under `parent_dir`.
    pub fn new(
        parent_dir: &Path,
        base_python: &str,
        python_version: &str,
    ) -> Result<Self, BuildError> {
        let path = parent_dir.join(format!("build-{python_version}"));
        let python = path.join("bin").join("python3");
        let env = Self { path, python };
        env.create(base_python)?;
        Ok(env)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn python(&self) -> &Path {
        &self.python
    }

    fn create(&self, base_python: &str) -> Result<(), BuildError> {
        if self.path.exists() {
            info!("reusing build environment in {}", self.path.display());
            return Ok(());
        }
        debug!("creating build environment in {}", self.path.display());
        run_command(
            &[
                base_python.to_string(),
                "-m".to_string(),
                "venv".to_string(),
                self.path.to_string_lossy().to_string(),
            ],
            &CommandOptions::default(),
        )?;
        info!("created build environment in {}", self.path.display());
        Ok(())
    }

    /// Install requirements into the environment with pip, binary-only,
    /// against the given wheel server.
    pub fn install(
        &self,
        requirements: &[Requirement],
        wheel_server_args: &[String],
        extra_environ: &HashMap<String, String>,
    ) -> Result<(), BuildError> {
        if requirements.is_empty() {
            return Ok(());
        }
        let req_filename = self.path.join("requirements.txt");
        let mut content = String::new();
        for requirement in requirements {
            content.push_str(&requirement.to_string());
            content.push('\n');
        }
        fs_err::write(&req_filename, content)?;

        let mut command = vec![
            self.python.to_string_lossy().to_string(),
            "-m".to_string(),
            "pip".to_string(),
            "install".to_string(),
            "--disable-pip-version-check".to_string(),
            "--only-binary".to_string(),
            ":all:".to_string(),
        ];
        command.extend(wheel_server_args.iter().cloned());
        command.push("-r".to_string());
        command.push(req_filename.to_string_lossy().to_string());

        let options = CommandOptions {
            cwd: self.path.parent().map(Path::to_path_buf),
            extra_environ: extra_environ.clone(),
            ..Default::default()
        };
        run_command(&command, &options)?;
        info!(
            "installed dependencies into build environment in {}",
            self.path.display()
        );
        Ok(())
    }
}
