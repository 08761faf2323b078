use std::fmt::{Display, Formatter};
use std::sync::Arc;

use tokio::sync::OnceCell;

use fromager_client::IndexClient;
use fromager_distribution_filename::BuildTag;
use fromager_normalize::{ExtraName, PackageName};
use fromager_pep440::Version;
use fromager_pypi_types::Metadata;

use crate::ResolverError;

/// A concrete `(name, version, url)` the resolver selected.
///
/// Immutable once constructed; the metadata is fetched lazily on first
/// access and memoized, preferring the PEP 658 sidecar and falling back to
/// zip-inspecting the wheel.
#[derive(Debug, Clone)]
pub struct Candidate {
    name: PackageName,
    version: Version,
    url: String,
    extras: Vec<ExtraName>,
    is_sdist: bool,
    build_tag: Option<BuildTag>,
    /// The PEP 658 sidecar URL, when the index advertised one.
    metadata_url: Option<String>,
    metadata: Arc<OnceCell<Metadata>>,
}

impl Candidate {
    pub fn new(
        name: PackageName,
        version: Version,
        url: impl Into<String>,
        extras: Vec<ExtraName>,
        is_sdist: bool,
        build_tag: Option<BuildTag>,
    ) -> Self {
        Self {
            name,
            version,
            url: url.into(),
            extras,
            is_sdist,
            build_tag,
            metadata_url: None,
            metadata: Arc::new(OnceCell::new()),
        }
    }

    #[must_use]
    pub fn with_metadata_url(mut self, metadata_url: Option<String>) -> Self {
        self.metadata_url = metadata_url;
        self
    }

    pub fn name(&self) -> &PackageName {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn extras(&self) -> &[ExtraName] {
        &self.extras
    }

    pub fn is_sdist(&self) -> bool {
        self.is_sdist
    }

    pub fn build_tag(&self) -> Option<&BuildTag> {
        self.build_tag.as_ref()
    }

    /// Sort key for descending candidate ordering.
    pub(crate) fn sort_key(&self) -> (Version, Option<BuildTag>) {
        (self.version.clone(), self.build_tag.clone())
    }

    /// The wheel metadata, fetched once and cached for the lifetime of the
    /// candidate.
    pub async fn metadata(&self, client: &IndexClient) -> Result<&Metadata, ResolverError> {
        self.metadata
            .get_or_try_init(|| async {
                if let Some(metadata_url) = &self.metadata_url {
                    match client.get_text(metadata_url).await {
                        Ok(text) => match Metadata::parse(text.as_bytes()) {
                            Ok(metadata) => return Ok(metadata),
                            Err(err) => {
                                tracing::debug!(
                                    "{}: metadata sidecar unusable, reading wheel: {err}",
                                    self.name
                                );
                            }
                        },
                        Err(err) => {
                            tracing::debug!(
                                "{}: metadata sidecar fetch failed, reading wheel: {err}",
                                self.name
                            );
                        }
                    }
                }
                Ok(client.metadata_from_wheel(&self.url).await?)
            })
            .await
    }
}

impl Display for Candidate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.extras.is_empty() {
            write!(f, "<{}=={}>", self.name, self.version)
        } else {
            let extras: Vec<&str> = self.extras.iter().map(ExtraName::as_str).collect();
            write!(f, "<{}[{}]=={}>", self.name, extras.join(","), self.version)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(extras: &[&str]) -> Candidate {
        Candidate::new(
            PackageName::new("egg").unwrap(),
            "1.0".parse().unwrap(),
            "https://example.com/egg-1.0-py3-none-any.whl",
            extras
                .iter()
                .map(|extra| ExtraName::new(extra).unwrap())
                .collect(),
            false,
            None,
        )
    }

    #[test]
    fn display_omits_build_tag() {
        assert_eq!(candidate(&[]).to_string(), "<egg==1.0>");
        assert_eq!(candidate(&["a", "b"]).to_string(), "<egg[a,b]==1.0>");
    }
}
