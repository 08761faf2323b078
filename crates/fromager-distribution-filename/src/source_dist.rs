use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fromager_normalize::{InvalidNameError, PackageName};
use fromager_pep440::{Version, VersionParseError};

/// The archive formats a source distribution may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceDistExtension {
    TarGz,
    Zip,
}

impl SourceDistExtension {
    /// Split the extension off a source distribution filename.
    pub fn from_filename(filename: &str) -> Option<(&str, Self)> {
        if let Some(stem) = filename.strip_suffix(".tar.gz") {
            return Some((stem, Self::TarGz));
        }
        if let Some(stem) = filename.strip_suffix(".zip") {
            return Some((stem, Self::Zip));
        }
        None
    }
}

impl Display for SourceDistExtension {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TarGz => write!(f, "tar.gz"),
            Self::Zip => write!(f, "zip"),
        }
    }
}

/// A parsed source distribution filename, e.g. `pbr-6.0.0.tar.gz`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceDistFilename {
    pub name: PackageName,
    pub version: Version,
    pub extension: SourceDistExtension,
}

impl SourceDistFilename {
    /// Parse a filename known to belong to `package_name`.
    ///
    /// Source distribution names are not reliably normalized, so the split
    /// point is located by the *length* of the package name rather than its
    /// exact spelling, the same trick the original index scrapers use to
    /// reject entries like `cffi-1.0.2-2.tar.gz` producing `cffi-1-0-2`.
    pub fn parse(
        filename: &str,
        package_name: &PackageName,
    ) -> Result<Self, SourceDistFilenameError> {
        let Some((stem, extension)) = SourceDistExtension::from_filename(filename) else {
            return Err(SourceDistFilenameError::InvalidExtension(
                filename.to_string(),
            ));
        };

        if stem.len() <= package_name.as_str().len() + 1 {
            return Err(SourceDistFilenameError::InvalidFilename {
                filename: filename.to_string(),
                package_name: package_name.to_string(),
            });
        }
        let (name_part, version_part) = stem.split_at(package_name.as_str().len());
        let name = PackageName::new(name_part)
            .map_err(|err| SourceDistFilenameError::InvalidPackageName(filename.to_string(), err))?;
        if name != *package_name {
            return Err(SourceDistFilenameError::InvalidFilename {
                filename: filename.to_string(),
                package_name: package_name.to_string(),
            });
        }
        let Some(version_part) = version_part.strip_prefix('-') else {
            return Err(SourceDistFilenameError::InvalidFilename {
                filename: filename.to_string(),
                package_name: package_name.to_string(),
            });
        };
        // A hyphen in the version part means the name split was ambiguous,
        // as in `cffi-1.0.2-2.tar.gz`; such entries are skipped upstream.
        if version_part.contains('-') {
            return Err(SourceDistFilenameError::InvalidFilename {
                filename: filename.to_string(),
                package_name: package_name.to_string(),
            });
        }
        let version = Version::from_str(version_part)
            .map_err(|err| SourceDistFilenameError::InvalidVersion(filename.to_string(), err))?;

        Ok(Self {
            name,
            version,
            extension,
        })
    }

    /// Parse a filename of unknown origin, splitting at the rightmost
    /// hyphen. Only reliable for normalized (PEP 625) filenames.
    pub fn parse_unchecked(filename: &str) -> Result<Self, SourceDistFilenameError> {
        let Some((stem, extension)) = SourceDistExtension::from_filename(filename) else {
            return Err(SourceDistFilenameError::InvalidExtension(
                filename.to_string(),
            ));
        };
        let Some((name_part, version_part)) = stem.rsplit_once('-') else {
            return Err(SourceDistFilenameError::InvalidFilename {
                filename: filename.to_string(),
                package_name: String::new(),
            });
        };
        let name = PackageName::new(name_part)
            .map_err(|err| SourceDistFilenameError::InvalidPackageName(filename.to_string(), err))?;
        let version = Version::from_str(version_part)
            .map_err(|err| SourceDistFilenameError::InvalidVersion(filename.to_string(), err))?;
        Ok(Self {
            name,
            version,
            extension,
        })
    }
}

impl Display for SourceDistFilename {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}.{}",
            self.name.as_dist_info_name(),
            self.version,
            self.extension
        )
    }
}

#[derive(Error, Debug)]
pub enum SourceDistFilenameError {
    #[error("The source distribution filename \"{0}\" has an unknown extension")]
    InvalidExtension(String),
    #[error("The source distribution filename \"{filename}\" does not match package \"{package_name}\"")]
    InvalidFilename {
        filename: String,
        package_name: String,
    },
    #[error("The source distribution filename \"{0}\" has an invalid package name")]
    InvalidPackageName(String, #[source] InvalidNameError),
    #[error("The source distribution filename \"{0}\" has an invalid version: {1}")]
    InvalidVersion(String, VersionParseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> PackageName {
        PackageName::new(s).unwrap()
    }

    #[test]
    fn parse_tar_gz() {
        let parsed = SourceDistFilename::parse("pbr-6.0.0.tar.gz", &name("pbr")).unwrap();
        assert_eq!(parsed.name, name("pbr"));
        assert_eq!(parsed.version, Version::from_str("6.0.0").unwrap());
        assert_eq!(parsed.extension, SourceDistExtension::TarGz);
    }

    #[test]
    fn parse_zip() {
        let parsed =
            SourceDistFilename::parse("charset-normalizer-3.3.2.zip", &name("charset-normalizer"))
                .unwrap();
        assert_eq!(parsed.version, Version::from_str("3.3.2").unwrap());
    }

    #[test]
    fn parse_non_normalized_spelling() {
        // `oslo.messaging` ships as `oslo.messaging-14.7.0.tar.gz`.
        let parsed =
            SourceDistFilename::parse("oslo.messaging-14.7.0.tar.gz", &name("oslo-messaging"))
                .unwrap();
        assert_eq!(parsed.name, name("oslo-messaging"));
    }

    #[test]
    fn reject_mangled_name() {
        // `cffi-1.0.2-2.tar.gz` would canonicalize to `cffi-1-0-2`; the
        // length check rejects it for package `cffi`.
        assert!(SourceDistFilename::parse("cffi-1.0.2-2.tar.gz", &name("cffi")).is_err());
    }

    #[test]
    fn reject_other_package() {
        assert!(SourceDistFilename::parse("requests-2.0.tar.gz", &name("flask")).is_err());
    }

    #[test]
    fn parse_unchecked() {
        let parsed = SourceDistFilename::parse_unchecked("pbr-6.0.0.tar.gz").unwrap();
        assert_eq!(parsed.name, name("pbr"));
    }

    #[test]
    fn unknown_extension() {
        assert!(SourceDistFilename::parse("pbr-6.0.0.rpm", &name("pbr")).is_err());
    }
}
