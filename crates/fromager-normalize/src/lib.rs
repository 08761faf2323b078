//! Normalized Python package and extra names.
//!
//! <https://packaging.python.org/en/latest/specifications/name-normalization/>

use std::borrow::Cow;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// The normalized name of a package.
///
/// Converts the name to lowercase and collapses runs of `-`, `_`, and `.`
/// down to a single `-`, e.g., `---`, `.`, and `__` are all converted to
/// a single `-`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageName(String);

impl PackageName {
    /// Create a validated, normalized package name.
    pub fn new(name: &str) -> Result<Self, InvalidNameError> {
        validate_and_normalize(name).map(Self)
    }

    /// Escape the name with underscores (`_`) instead of dashes (`-`).
    ///
    /// This is the form used in wheel and sdist filenames and in
    /// `.dist-info` directory names.
    pub fn as_dist_info_name(&self) -> Cow<'_, str> {
        if self.0.contains('-') {
            Cow::Owned(self.0.replace('-', "_"))
        } else {
            Cow::Borrowed(&self.0)
        }
    }

    /// The module name used for filesystem lookups of overrides: settings
    /// files, patch directories, and plugin registrations.
    pub fn as_override_module_name(&self) -> Cow<'_, str> {
        self.as_dist_info_name()
    }

    /// Returns the underlying package name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PackageName {
    type Err = InvalidNameError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::new(name)
    }
}

impl AsRef<str> for PackageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for PackageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for PackageName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PackageName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(&s).map_err(de::Error::custom)
    }
}

/// The normalized name of an extra dependency group.
///
/// Normalization is the same as for package names, per PEP 685.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExtraName(String);

impl ExtraName {
    /// Create a validated, normalized extra name.
    pub fn new(name: &str) -> Result<Self, InvalidNameError> {
        validate_and_normalize(name).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ExtraName {
    type Err = InvalidNameError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::new(name)
    }
}

impl AsRef<str> for ExtraName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for ExtraName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for ExtraName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ExtraName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(&s).map_err(de::Error::custom)
    }
}

/// Validate and normalize a package or extra name, per PEP 503.
///
/// A valid name consists only of ASCII alphanumerics, `-`, `_`, and `.`,
/// and must start and end with an alphanumeric character.
fn validate_and_normalize(name: &str) -> Result<String, InvalidNameError> {
    let mut normalized = String::with_capacity(name.len());
    let mut last = None;
    for char in name.bytes() {
        match char {
            b'A'..=b'Z' => {
                normalized.push(char.to_ascii_lowercase() as char);
            }
            b'a'..=b'z' | b'0'..=b'9' => {
                normalized.push(char as char);
            }
            b'-' | b'_' | b'.' => {
                match last {
                    // Names can't start with punctuation.
                    None => return Err(InvalidNameError(name.to_string())),
                    Some(b'-' | b'_' | b'.') => {}
                    Some(_) => normalized.push('-'),
                }
            }
            _ => return Err(InvalidNameError(name.to_string())),
        }
        last = Some(char);
    }
    // Names can't end with punctuation.
    if matches!(last, None | Some(b'-' | b'_' | b'.')) {
        return Err(InvalidNameError(name.to_string()));
    }
    Ok(normalized)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "Not a valid package or extra name: \"{0}\". Names must start and end \
     with a letter or digit and may only contain -, _, ., and alphanumeric characters."
)]
pub struct InvalidNameError(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize() {
        let inputs = [
            "friendly-bard",
            "Friendly-Bard",
            "FRIENDLY-BARD",
            "friendly.bard",
            "friendly_bard",
            "friendly--bard",
            "FrIeNdLy-._.-bArD",
        ];
        for input in inputs {
            assert_eq!(
                PackageName::new(input).unwrap().as_str(),
                "friendly-bard",
                "{input}"
            );
        }
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = PackageName::new("FrIeNdLy-._.-bArD").unwrap();
        let twice = PackageName::new(once.as_str()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn dist_info_name() {
        assert_eq!(
            PackageName::new("friendly-bard").unwrap().as_dist_info_name(),
            "friendly_bard"
        );
        assert_eq!(PackageName::new("bard").unwrap().as_dist_info_name(), "bard");
    }

    #[test]
    fn unchanged() {
        let unchanged = ["friendly-bard", "1okay", "okay2"];
        for input in unchanged {
            assert_eq!(PackageName::new(input).unwrap().as_str(), input);
        }
    }

    #[test]
    fn failures() {
        let failures = [
            " starts-with-space",
            "-starts-with-dash",
            "ends-with-dash-",
            "ends-with-space ",
            "includes!invalid-char",
            "space in middle",
            "",
        ];
        for input in failures {
            assert!(PackageName::new(input).is_err(), "{input:?}");
        }
    }

    #[test]
    fn extra_name() {
        assert_eq!(ExtraName::new("B_c").unwrap().as_str(), "b-c");
    }
}
