//! Compatible wheel tags for a Python version and platform, the subset of
//! `packaging.tags.sys_tags()` the resolver needs to filter wheel
//! candidates.

use std::collections::HashSet;
use std::fmt::{Display, Formatter};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("unsupported host platform for wheel tags")]
    UnsupportedHost,
}

/// A set of compatible tags for a given Python version and platform, in
/// (`python_tag`, `abi_tag`, `platform_tag`) format.
#[derive(Debug, Clone)]
pub struct Tags(HashSet<(String, String, String)>);

impl Tags {
    /// Returns the compatible tags for the given Python version on the host
    /// platform.
    pub fn from_env(python_version: (u8, u8)) -> Result<Self, PlatformError> {
        let platform_tags = compatible_platform_tags()?;
        let (major, minor) = python_version;

        let mut tags = Vec::with_capacity(5 * platform_tags.len());

        // 1. This exact C API version.
        for platform_tag in &platform_tags {
            tags.push((
                format!("cp{major}{minor}"),
                format!("cp{major}{minor}"),
                platform_tag.clone(),
            ));
            tags.push((
                format!("cp{major}{minor}"),
                "none".to_string(),
                platform_tag.clone(),
            ));
        }
        // 2. abi3, from the current version down (3.2 is the abi3 floor).
        for abi3_minor in 2..=minor {
            for platform_tag in &platform_tags {
                tags.push((
                    format!("cp{major}{abi3_minor}"),
                    "abi3".to_string(),
                    platform_tag.clone(),
                ));
            }
        }
        // 3. No abi, e.g. plain python source wheels.
        for py_minor in 0..=minor {
            for platform_tag in &platform_tags {
                tags.push((
                    format!("py{major}{py_minor}"),
                    "none".to_string(),
                    platform_tag.clone(),
                ));
            }
        }
        // 4. Major only.
        for platform_tag in &platform_tags {
            tags.push((format!("py{major}"), "none".to_string(), platform_tag.clone()));
        }
        // 5. No binary.
        for py_minor in 0..=minor {
            tags.push((
                format!("py{major}{py_minor}"),
                "none".to_string(),
                "any".to_string(),
            ));
        }
        tags.push((format!("py{major}"), "none".to_string(), "any".to_string()));
        tags.push((
            format!("cp{major}{minor}"),
            "none".to_string(),
            "any".to_string(),
        ));

        Ok(Self(tags.into_iter().collect()))
    }

    /// Whether any combination of the wheel's tag triples is in the
    /// supported set.
    pub fn is_compatible(
        &self,
        python_tags: &[String],
        abi_tags: &[String],
        platform_tags: &[String],
    ) -> bool {
        for python_tag in python_tags {
            for abi_tag in abi_tags {
                for platform_tag in platform_tags {
                    if self.0.contains(&(
                        python_tag.clone(),
                        abi_tag.clone(),
                        platform_tag.clone(),
                    )) {
                        return true;
                    }
                }
            }
        }
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String, String)> {
        self.0.iter()
    }
}

impl Display for Tags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (python_tag, abi_tag, platform_tag) in &self.0 {
            writeln!(f, "{python_tag}-{abi_tag}-{platform_tag}")?;
        }
        Ok(())
    }
}

/// Platform tags for the host (e.g., `manylinux_2_17_x86_64`,
/// `macosx_11_0_arm64`, or `win_amd64`), newest glibc/macOS floor first.
fn compatible_platform_tags() -> Result<Vec<String>, PlatformError> {
    let arch = if cfg!(target_arch = "aarch64") {
        "aarch64"
    } else if cfg!(target_arch = "x86_64") {
        "x86_64"
    } else if cfg!(target_arch = "powerpc64le") {
        "ppc64le"
    } else {
        return Err(PlatformError::UnsupportedHost);
    };

    if cfg!(target_os = "linux") {
        let mut tags = vec![format!("linux_{arch}")];
        // Manylinux tags down to the glibc 2.17 (manylinux2014) floor.
        for minor in (17..=39).rev() {
            tags.push(format!("manylinux_2_{minor}_{arch}"));
        }
        tags.push(format!("manylinux2014_{arch}"));
        Ok(tags)
    } else if cfg!(target_os = "macos") {
        let arch = if cfg!(target_arch = "aarch64") {
            "arm64"
        } else {
            arch
        };
        let mut tags = Vec::new();
        for major in (11..=15).rev() {
            tags.push(format!("macosx_{major}_0_{arch}"));
            tags.push(format!("macosx_{major}_0_universal2"));
        }
        for minor in (9..=16).rev() {
            tags.push(format!("macosx_10_{minor}_{arch}"));
            tags.push(format!("macosx_10_{minor}_universal2"));
        }
        Ok(tags)
    } else if cfg!(windows) {
        Ok(vec![if cfg!(target_arch = "aarch64") {
            "win_arm64".to_string()
        } else {
            "win_amd64".to_string()
        }])
    } else {
        Err(PlatformError::UnsupportedHost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> Tags {
        Tags::from_env((3, 11)).unwrap()
    }

    fn split(tag: &str) -> Vec<String> {
        tag.split('.').map(String::from).collect()
    }

    #[test]
    fn pure_python_wheel_is_compatible() {
        assert!(tags().is_compatible(&split("py3"), &split("none"), &split("any")));
        assert!(tags().is_compatible(&split("py2.py3"), &split("none"), &split("any")));
    }

    #[test]
    fn exact_cpython_wheel() {
        assert!(tags().is_compatible(&split("cp311"), &split("cp311"), &split("any")));
        assert!(!tags().is_compatible(&split("cp312"), &split("cp312"), &split("any")));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn manylinux() {
        let arch = if cfg!(target_arch = "aarch64") {
            "aarch64"
        } else {
            "x86_64"
        };
        assert!(tags().is_compatible(
            &split("cp311"),
            &split("cp311"),
            &split(&format!(
                "manylinux_2_17_{arch}.manylinux2014_{arch}"
            )),
        ));
        assert!(tags().is_compatible(
            &split("cp37"),
            &split("abi3"),
            &split(&format!("manylinux2014_{arch}")),
        ));
        assert!(!tags().is_compatible(&split("cp311"), &split("cp311"), &split("win_amd64")));
    }
}
