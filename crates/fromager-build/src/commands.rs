use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::BuildError;

/// Substrings in subprocess output that mean the command hit the network
/// while isolation was active.
const NETWORK_ERROR_MARKERS: &[&str] = &[
    "connection refused",
    "network unreachable",
    "Network is unreachable",
];

/// How many trailing output characters to keep in error messages.
const OUTPUT_TAIL: usize = 4000;

/// Options for [`run_command`].
#[derive(Debug, Default)]
pub struct CommandOptions {
    pub cwd: Option<PathBuf>,
    /// Extra env vars layered over the inherited environment.
    pub extra_environ: HashMap<String, String>,
    /// Run inside a fresh user+network namespace (Linux only).
    pub network_isolated: bool,
    /// Also append combined output to this file.
    pub log_file: Option<PathBuf>,
}

/// Whether this host can run commands without network access.
///
/// Uses `unshare -rn`, which needs Linux and the unshare binary.
pub fn network_isolation_available() -> bool {
    cfg!(target_os = "linux") && which::which("unshare").is_ok()
}

/// Run a command, returning its stdout. On non-zero exit the captured
/// output tail rides in the error; network-related failures under
/// isolation are raised as the distinct [`BuildError::NetworkIsolation`].
pub fn run_command(command: &[String], options: &CommandOptions) -> Result<String, BuildError> {
    let mut argv: Vec<&str> = Vec::new();
    if options.network_isolated {
        if !network_isolation_available() {
            return Err(BuildError::IsolationUnavailable);
        }
        argv.extend(["unshare", "--net", "--map-current-user"]);
    }
    argv.extend(command.iter().map(String::as_str));

    debug!(
        "running: {} in {}",
        argv.join(" "),
        options
            .cwd
            .as_deref()
            .unwrap_or_else(|| Path::new("."))
            .display()
    );

    let mut cmd = Command::new(argv[0]);
    cmd.args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &options.extra_environ {
        cmd.env(key, value);
    }

    let output = cmd.output()?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let combined = format!("{stdout}{stderr}");

    if let Some(log_file) = &options.log_file {
        use std::io::Write;
        let mut file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        file.write_all(combined.as_bytes())?;
    }

    if !output.status.success() {
        let command_line = argv.join(" ");
        let output_tail = tail(&combined, OUTPUT_TAIL);
        if options.network_isolated && is_network_error(&combined) {
            return Err(BuildError::NetworkIsolation {
                command: command_line,
                output_tail,
            });
        }
        return Err(BuildError::CommandFailed {
            command: command_line,
            status: output.status.to_string(),
            output_tail,
        });
    }
    Ok(stdout)
}

/// Whether output text carries one of the known network failure markers.
pub(crate) fn is_network_error(output: &str) -> bool {
    let lowered = output.to_lowercase();
    NETWORK_ERROR_MARKERS
        .iter()
        .any(|marker| lowered.contains(&marker.to_lowercase()))
}

fn tail(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let start = text.len() - limit;
    // Don't split a UTF-8 sequence.
    let start = (start..text.len())
        .find(|index| text.is_char_boundary(*index))
        .unwrap_or(start);
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn captures_stdout() {
        let out = run_command(&args(&["echo", "hello"]), &CommandOptions::default()).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn nonzero_exit_is_error() {
        let err = run_command(&args(&["false"]), &CommandOptions::default()).unwrap_err();
        assert!(matches!(err, BuildError::CommandFailed { .. }));
    }

    #[test]
    fn extra_environ_applies() {
        let options = CommandOptions {
            extra_environ: HashMap::from([("MARKER".to_string(), "42".to_string())]),
            ..Default::default()
        };
        let out = run_command(&args(&["sh", "-c", "echo $MARKER"]), &options).unwrap();
        assert_eq!(out.trim(), "42");
    }

    #[test]
    fn network_markers() {
        assert!(is_network_error("curl: (7) Connection refused"));
        assert!(is_network_error("socket error: Network is unreachable"));
        assert!(!is_network_error("compile error: missing semicolon"));
    }
}
