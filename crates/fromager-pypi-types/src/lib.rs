//! Shared types for the simple repository API
//! ([PEP 503](https://peps.python.org/pep-0503/),
//! [PEP 691](https://peps.python.org/pep-0691/)) and for core metadata
//! parsed from `*.dist-info/METADATA`.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fromager_normalize::{ExtraName, PackageName};
use fromager_pep440::{Version, VersionSpecifiers};
use fromager_pep508::Requirement;

/// A single file in a simple-index project listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct File {
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub hashes: Hashes,
    /// The `data-requires-python` attribute, kept unparsed: indexes carry
    /// invalid specifiers (e.g. `>= '2.7'`) that must be skipped, not fail
    /// the whole page.
    #[serde(default, rename = "requires-python")]
    pub requires_python: Option<String>,
    /// PEP 658: whether a `.metadata` sidecar is served for this file.
    #[serde(
        default,
        rename = "core-metadata",
        alias = "data-dist-info-metadata",
        alias = "dist-info-metadata"
    )]
    pub dist_info_metadata: Option<DistInfoMetadata>,
    #[serde(default)]
    pub yanked: Option<Yanked>,
}

impl File {
    /// Whether the PEP 658 metadata sidecar is advertised as available.
    pub fn has_metadata(&self) -> bool {
        self.dist_info_metadata
            .as_ref()
            .is_some_and(DistInfoMetadata::is_available)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hashes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// The PEP 658 metadata attribute: either a plain availability flag or a
/// hash map of the sidecar file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DistInfoMetadata {
    Bool(bool),
    Hashes(Hashes),
}

impl DistInfoMetadata {
    pub fn is_available(&self) -> bool {
        match self {
            Self::Bool(available) => *available,
            Self::Hashes(_) => true,
        }
    }
}

/// The `yanked` attribute: a flag or the reason string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Yanked {
    Bool(bool),
    Reason(String),
}

impl Yanked {
    pub fn is_yanked(&self) -> bool {
        match self {
            Self::Bool(yanked) => *yanked,
            Self::Reason(_) => true,
        }
    }
}

/// A PEP 691 project page.
#[derive(Debug, Clone, Deserialize)]
pub struct SimpleJson {
    pub files: Vec<File>,
}

/// The subset of core metadata the bootstrap needs, parsed from a
/// `METADATA` file (RFC 822 headers).
#[derive(Debug, Clone)]
pub struct Metadata {
    pub name: PackageName,
    pub version: Version,
    pub requires_dist: Vec<Requirement>,
    pub requires_python: Option<VersionSpecifiers>,
    pub provides_extras: Vec<ExtraName>,
}

impl Metadata {
    /// Parse a `METADATA` file.
    pub fn parse(content: &[u8]) -> Result<Self, MetadataError> {
        let parsed = mailparse::parse_mail(content)?;
        let headers = &parsed.headers;

        let name = header(&headers, "Name").ok_or(MetadataError::MissingName)?;
        let name = PackageName::new(&name)
            .map_err(|err| MetadataError::InvalidName(err.to_string()))?;
        let version = header(&headers, "Version").ok_or(MetadataError::MissingVersion)?;
        let version = Version::from_str(&version)
            .map_err(|err| MetadataError::InvalidVersion(err.to_string()))?;

        let mut requires_dist = Vec::new();
        for raw in all_headers(&headers, "Requires-Dist") {
            let requirement = Requirement::from_str(&raw)
                .map_err(|err| MetadataError::InvalidRequirement(raw.clone(), err.to_string()))?;
            requires_dist.push(requirement);
        }

        let requires_python = header(&headers, "Requires-Python")
            .map(|raw| {
                VersionSpecifiers::from_str(&raw)
                    .map_err(|err| MetadataError::InvalidRequiresPython(err.to_string()))
            })
            .transpose()?;

        let provides_extras = all_headers(&headers, "Provides-Extra")
            .into_iter()
            .filter_map(|raw| ExtraName::new(&raw).ok())
            .collect();

        Ok(Self {
            name,
            version,
            requires_dist,
            requires_python,
            provides_extras,
        })
    }
}

fn header(headers: &[mailparse::MailHeader], key: &str) -> Option<String> {
    use mailparse::MailHeaderMap;
    headers.get_first_value(key)
}

fn all_headers(headers: &[mailparse::MailHeader], key: &str) -> Vec<String> {
    use mailparse::MailHeaderMap;
    headers.get_all_values(key)
}

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error(transparent)]
    Parse(#[from] mailparse::MailParseError),
    #[error("METADATA is missing the Name field")]
    MissingName,
    #[error("METADATA is missing the Version field")]
    MissingVersion,
    #[error("METADATA has an invalid Name: {0}")]
    InvalidName(String),
    #[error("METADATA has an invalid Version: {0}")]
    InvalidVersion(String),
    #[error("METADATA has an invalid Requires-Dist `{0}`: {1}")]
    InvalidRequirement(String, String),
    #[error("METADATA has an invalid Requires-Python: {0}")]
    InvalidRequiresPython(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const METADATA: &str = "Metadata-Version: 2.1\r\n\
        Name: mypackage\r\n\
        Version: 1.0.0\r\n\
        Requires-Dist: requests >=2.26\r\n\
        Requires-Dist: pytest ; extra == 'test'\r\n\
        Requires-Python: >=3.8\r\n\
        Provides-Extra: test\r\n\
        \r\n\
        Long description here.\r\n";

    #[test]
    fn parse_metadata() {
        let metadata = Metadata::parse(METADATA.as_bytes()).unwrap();
        assert_eq!(metadata.name, PackageName::new("mypackage").unwrap());
        assert_eq!(metadata.version, Version::from_str("1.0.0").unwrap());
        assert_eq!(metadata.requires_dist.len(), 2);
        assert_eq!(metadata.provides_extras.len(), 1);
        assert!(metadata.requires_python.is_some());
    }

    #[test]
    fn missing_name() {
        assert!(matches!(
            Metadata::parse(b"Version: 1.0\r\n\r\n"),
            Err(MetadataError::MissingName)
        ));
    }

    #[test]
    fn file_json_round_trip() {
        let raw = r#"{
            "filename": "pbr-6.0.0-py2.py3-none-any.whl",
            "url": "https://files.pythonhosted.org/pbr-6.0.0-py2.py3-none-any.whl",
            "hashes": {"sha256": "deadbeef"},
            "requires-python": ">=2.6",
            "core-metadata": {"sha256": "cafe"},
            "yanked": false
        }"#;
        let file: File = serde_json::from_str(raw).unwrap();
        assert!(file.has_metadata());
        assert_eq!(file.hashes.sha256.as_deref(), Some("deadbeef"));
        assert!(!file.yanked.unwrap().is_yanked());
    }

    #[test]
    fn dist_info_metadata_bool() {
        let file: File = serde_json::from_str(
            r#"{"filename": "a.whl", "url": "u", "core-metadata": false}"#,
        )
        .unwrap();
        assert!(!file.has_metadata());
    }
}
