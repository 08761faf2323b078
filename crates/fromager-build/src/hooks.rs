use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::str::FromStr;

use indoc::formatdoc;
use tracing::debug;

use fromager_pep508::Requirement;

use crate::commands::is_network_error;
use crate::BuildError;

/// The `[build-system]` table of a `pyproject.toml`, with the legacy
/// setuptools defaults applied when keys are missing.
///
/// From pypa/build: if the file or the `build-backend` key is absent, tools
/// revert to `setuptools.build_meta:__legacy__`. `requires` can be set
/// without `build-backend` (pyarrow does this).
#[derive(Debug, Clone)]
pub struct BuildBackend {
    pub build_backend: String,
    pub backend_path: Option<Vec<String>>,
    pub requires: Vec<String>,
}

impl Default for BuildBackend {
    fn default() -> Self {
        Self {
            build_backend: "setuptools.build_meta:__legacy__".to_string(),
            backend_path: None,
            requires: vec!["setuptools >= 40.8.0".to_string()],
        }
    }
}

/// Read the build backend settings from `<build_dir>/pyproject.toml`,
/// overlaying the defaults key by key.
pub fn get_build_backend(build_dir: &Path) -> Result<BuildBackend, BuildError> {
    let pyproject_path = build_dir.join("pyproject.toml");
    let mut backend = BuildBackend::default();
    if !pyproject_path.exists() {
        return Ok(backend);
    }
    let parsed: toml::Value = toml::from_str(&fs_err::read_to_string(&pyproject_path)?)?;
    let Some(build_system) = parsed.get("build-system") else {
        return Ok(backend);
    };
    if let Some(name) = build_system.get("build-backend").and_then(|v| v.as_str()) {
        backend.build_backend = name.to_string();
    }
    if let Some(paths) = build_system.get("backend-path").and_then(|v| v.as_array()) {
        backend.backend_path = Some(
            paths
                .iter()
                .filter_map(|p| p.as_str())
                .map(String::from)
                .collect(),
        );
    }
    if let Some(requires) = build_system.get("requires").and_then(|v| v.as_array()) {
        backend.requires = requires
            .iter()
            .filter_map(|r| r.as_str())
            .map(String::from)
            .collect();
    }
    Ok(backend)
}

/// Executes PEP 517 hooks by running the backend in a subprocess with the
/// build environment's interpreter.
#[derive(Debug)]
pub struct HookCaller {
    python: PathBuf,
    build_dir: PathBuf,
    backend: BuildBackend,
    extra_environ: HashMap<String, String>,
    network_isolated: bool,
}

impl HookCaller {
    pub fn new(
        python: PathBuf,
        build_dir: PathBuf,
        backend: BuildBackend,
        extra_environ: HashMap<String, String>,
        network_isolated: bool,
    ) -> Self {
        Self {
            python,
            build_dir,
            backend,
            extra_environ,
            network_isolated,
        }
    }

    fn backend_import(&self) -> String {
        match self.backend.build_backend.split_once(':') {
            Some((module, object)) => format!("from {module} import {object}"),
            None => format!("import {}", self.backend.build_backend),
        }
    }

    fn backend_path_setup(&self) -> String {
        match &self.backend.backend_path {
            Some(paths) => {
                let entries: Vec<String> =
                    paths.iter().map(|p| format!("{p:?}")).collect();
                format!("import sys; sys.path[:0] = [{}]", entries.join(", "))
            }
            None => String::new(),
        }
    }

    fn run_python_script(&self, script: &str) -> Result<Output, BuildError> {
        debug!("running PEP 517 hook in {}", self.build_dir.display());
        let mut command;
        if self.network_isolated {
            command = Command::new("unshare");
            command.args(["--net", "--map-current-user"]);
            command.arg(&self.python);
        } else {
            command = Command::new(&self.python);
        }
        command
            .args(["-c", script])
            .current_dir(&self.build_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.extra_environ {
            command.env(key, value);
        }
        Ok(command.output()?)
    }

    fn check(&self, message: &str, output: Output) -> Result<Output, BuildError> {
        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if self.network_isolated && is_network_error(&stderr) {
            return Err(BuildError::NetworkIsolation {
                command: message.to_string(),
                output_tail: stderr.trim().to_string(),
            });
        }
        Err(BuildError::from_command_output(message.to_string(), &output))
    }

    /// `get_requires_for_build_wheel()`, empty when the backend does not
    /// define the hook.
    pub fn get_requires_for_build_wheel(&self) -> Result<Vec<Requirement>, BuildError> {
        debug!(
            "calling `{}.get_requires_for_build_wheel()`",
            self.backend.build_backend
        );
        let script = formatdoc! {r#"
            {path_setup}
            {import} as backend
            import json

            if get_requires := getattr(backend, "get_requires_for_build_wheel", None):
                requires = get_requires()
            else:
                requires = []
            print(json.dumps(requires))
            "#,
            path_setup = self.backend_path_setup(),
            import = self.backend_import(),
        };
        let output = self.run_python_script(&script)?;
        let output = self.check(
            "Build backend failed to determine requires with `get_requires_for_build_wheel`",
            output,
        )?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let raw: Vec<String> =
            serde_json::from_str(stdout.lines().last().unwrap_or_default())?;
        raw.iter()
            .map(|entry| {
                Requirement::from_str(entry)
                    .map_err(|err| BuildError::InvalidRequirement(format!("{entry}: {err}")))
            })
            .collect()
    }

    /// `prepare_metadata_for_build_wheel(metadata_directory)`; returns the
    /// created `*.dist-info` directory name.
    pub fn prepare_metadata_for_build_wheel(
        &self,
        metadata_directory: &Path,
    ) -> Result<String, BuildError> {
        debug!(
            "calling `{}.prepare_metadata_for_build_wheel()`",
            self.backend.build_backend
        );
        let script = formatdoc! {r#"
            {path_setup}
            {import} as backend
            print(backend.prepare_metadata_for_build_wheel({directory:?}))
            "#,
            path_setup = self.backend_path_setup(),
            import = self.backend_import(),
            directory = metadata_directory.to_string_lossy(),
        };
        let output = self.run_python_script(&script)?;
        let output = self.check(
            "Build backend failed `prepare_metadata_for_build_wheel`",
            output,
        )?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .last()
            .map(str::to_string)
            .ok_or_else(|| BuildError::BackendFailure {
                message: "prepare_metadata_for_build_wheel returned no directory".to_string(),
                stdout: stdout.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
    }

    /// `build_wheel(wheel_directory)`; returns the path of the built wheel.
    pub fn build_wheel(&self, wheel_directory: &Path) -> Result<PathBuf, BuildError> {
        debug!("calling `{}.build_wheel()`", self.backend.build_backend);
        let script = formatdoc! {r#"
            {path_setup}
            {import} as backend
            print(backend.build_wheel({directory:?}))
            "#,
            path_setup = self.backend_path_setup(),
            import = self.backend_import(),
            directory = wheel_directory.to_string_lossy(),
        };
        let output = self.run_python_script(&script)?;
        let output = self.check(
            "Build backend failed to build wheel through `build_wheel()`",
            output,
        )?;
        self.artifact_from_output(&output, wheel_directory, "build_wheel()")
    }

    /// `build_sdist(sdist_directory)`; returns the path of the built sdist.
    pub fn build_sdist(&self, sdist_directory: &Path) -> Result<PathBuf, BuildError> {
        debug!("calling `{}.build_sdist()`", self.backend.build_backend);
        let script = formatdoc! {r#"
            {path_setup}
            {import} as backend
            print(backend.build_sdist({directory:?}))
            "#,
            path_setup = self.backend_path_setup(),
            import = self.backend_import(),
            directory = sdist_directory.to_string_lossy(),
        };
        let output = self.run_python_script(&script)?;
        let output = self.check(
            "Build backend failed to build sdist through `build_sdist()`",
            output,
        )?;
        self.artifact_from_output(&output, sdist_directory, "build_sdist()")
    }

    /// The backend prints the artifact filename on its last stdout line.
    fn artifact_from_output(
        &self,
        output: &Output,
        directory: &Path,
        hook: &str,
    ) -> Result<PathBuf, BuildError> {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let artifact = stdout
            .lines()
            .last()
            .map(|filename| directory.join(filename))
            .filter(|path| path.is_file());
        artifact.ok_or_else(|| BuildError::BackendFailure {
            message: format!("Build backend did not return the artifact filename through `{hook}`"),
            stdout: stdout.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backend_when_missing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = get_build_backend(dir.path())?;
        assert_eq!(backend.build_backend, "setuptools.build_meta:__legacy__");
        assert_eq!(backend.requires, vec!["setuptools >= 40.8.0"]);
        Ok(())
    }

    #[test]
    fn explicit_backend() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs_err::write(
            dir.path().join("pyproject.toml"),
            "[build-system]\nrequires = [\"flit_core >=3.2\"]\nbuild-backend = \"flit_core.buildapi\"\n",
        )?;
        let backend = get_build_backend(dir.path())?;
        assert_eq!(backend.build_backend, "flit_core.buildapi");
        assert_eq!(backend.requires, vec!["flit_core >=3.2"]);
        Ok(())
    }

    #[test]
    fn requires_without_backend_keeps_legacy_backend() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs_err::write(
            dir.path().join("pyproject.toml"),
            "[build-system]\nrequires = [\"cython\"]\n",
        )?;
        let backend = get_build_backend(dir.path())?;
        assert_eq!(backend.build_backend, "setuptools.build_meta:__legacy__");
        assert_eq!(backend.requires, vec!["cython"]);
        Ok(())
    }

    #[test]
    fn backend_import_forms() {
        let caller = HookCaller::new(
            PathBuf::from("python3"),
            PathBuf::from("."),
            BuildBackend {
                build_backend: "flit_core.buildapi".to_string(),
                backend_path: None,
                requires: vec![],
            },
            HashMap::new(),
            false,
        );
        assert_eq!(caller.backend_import(), "import flit_core.buildapi");

        let caller = HookCaller::new(
            PathBuf::from("python3"),
            PathBuf::from("."),
            BuildBackend::default(),
            HashMap::new(),
            false,
        );
        assert_eq!(
            caller.backend_import(),
            "from setuptools.build_meta import __legacy__"
        );
    }
}
