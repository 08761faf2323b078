use std::str::FromStr;

use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::{debug, trace};

use fromager_client::IndexClient;
use fromager_distribution_filename::DistFilename;
use fromager_normalize::{ExtraName, PackageName};
use fromager_pep440::{Version, VersionSpecifiers};
use fromager_pep508::Requirement;
use fromager_platform_tags::Tags;
use fromager_settings::Constraints;

use crate::{Candidate, ResolverError, GITHUB_API_URL};

/// Requirements under consideration, grouped by canonical name.
pub type RequirementsMap = IndexMap<PackageName, Vec<Requirement>>;

/// Candidates known to be unusable, grouped by canonical name.
pub type CandidatesMap = IndexMap<PackageName, Vec<Candidate>>;

/// A version source callback for the [`GenericProvider`]: `(url, version)`
/// pairs for a package.
pub type VersionSource =
    Box<dyn Fn(&PackageName) -> Vec<(String, Version)> + Send + Sync>;

/// The resolvelib-shaped provider protocol. Providers enumerate and filter
/// candidates; they never expand dependencies — that is the bootstrap
/// engine's job — so resolution is a single pinning pass.
#[async_trait]
pub trait Provider: Send + Sync {
    fn constraints(&self) -> &Constraints;

    /// The canonical identifier of a requirement.
    fn identify(&self, requirement: &Requirement) -> PackageName {
        requirement.name.clone()
    }

    /// The extras of a requirement as a sorted tuple.
    fn get_extras_for(&self, requirement: &Requirement) -> Vec<ExtraName> {
        requirement.sorted_extras()
    }

    /// All usable candidates for `identifier`, in descending
    /// `(version, build_tag)` order.
    async fn find_matches(
        &self,
        identifier: &PackageName,
        requirements: &RequirementsMap,
        incompatibilities: &CandidatesMap,
    ) -> Result<Vec<Candidate>, ResolverError>;

    /// Name match, requirement specifier match (pre-releases per policy),
    /// and constraint-set acceptance.
    fn is_satisfied_by(&self, requirement: &Requirement, candidate: &Candidate) -> bool {
        if requirement.name != *candidate.name() {
            return false;
        }
        let allow_prerelease = self.constraints().allow_prerelease(&requirement.name)
            || requirement.specifiers.prereleases_allowed();
        requirement
            .specifiers
            .contains_with_prereleases(candidate.version(), allow_prerelease)
            && self
                .constraints()
                .is_satisfied_by(&requirement.name, candidate.version())
    }

    /// Dependency expansion is the bootstrap engine's job, not the
    /// provider's.
    fn get_dependencies(&self, _candidate: &Candidate) -> Vec<Requirement> {
        Vec::new()
    }
}

/// Shared filtering for version-level checks: known-bad versions, the
/// requirement specifiers, and the constraint set.
fn version_is_usable(
    constraints: &Constraints,
    identifier: &PackageName,
    version: &Version,
    identifier_reqs: &[Requirement],
    bad_versions: &[Version],
) -> bool {
    if bad_versions.contains(version) {
        trace!("{identifier}: skipping known bad version {version}");
        return false;
    }
    let constraint_allows_prerelease = constraints.allow_prerelease(identifier);
    let matches_requirements = identifier_reqs.iter().all(|requirement| {
        let allow_prerelease =
            constraint_allows_prerelease || requirement.specifiers.prereleases_allowed();
        requirement
            .specifiers
            .contains_with_prereleases(version, allow_prerelease)
    });
    if !matches_requirements {
        trace!("{identifier}: skipping {version}, does not match requirements");
        return false;
    }
    if !constraints.is_satisfied_by(identifier, version) {
        trace!("{identifier}: skipping {version} due to constraint");
        return false;
    }
    true
}

fn bad_versions(incompatibilities: &CandidatesMap, identifier: &PackageName) -> Vec<Version> {
    incompatibilities
        .get(identifier)
        .map(|candidates| {
            candidates
                .iter()
                .map(|candidate| candidate.version().clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Lookup of package versions from a simple Python index (PyPI).
pub struct PyPiProvider {
    client: IndexClient,
    sdist_server_url: String,
    include_sdists: bool,
    include_wheels: bool,
    constraints: Constraints,
    tags: Tags,
    python_version: Version,
}

impl PyPiProvider {
    pub fn new(
        client: IndexClient,
        sdist_server_url: impl Into<String>,
        include_sdists: bool,
        include_wheels: bool,
        constraints: Constraints,
        tags: Tags,
        python_version: Version,
    ) -> Self {
        Self {
            client,
            sdist_server_url: sdist_server_url.into(),
            include_sdists,
            include_wheels,
            constraints,
            tags,
            python_version,
        }
    }
}

#[async_trait]
impl Provider for PyPiProvider {
    fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    async fn find_matches(
        &self,
        identifier: &PackageName,
        requirements: &RequirementsMap,
        incompatibilities: &CandidatesMap,
    ) -> Result<Vec<Candidate>, ResolverError> {
        let identifier_reqs = requirements.get(identifier).cloned().unwrap_or_default();
        let bad = bad_versions(incompatibilities, identifier);
        let extras: Vec<ExtraName> = identifier_reqs
            .iter()
            .flat_map(|requirement| requirement.extras.iter().cloned())
            .collect();

        let files = self.client.simple(&self.sdist_server_url, identifier).await?;
        debug!(
            "{identifier}: {} files on {}",
            files.len(),
            self.sdist_server_url
        );

        let mut candidates = Vec::new();
        for file in files {
            // Skip files that need a different Python. Invalid specifiers
            // occur in the wild (e.g. `>= '2.7'`) and mean "skip the file",
            // not "fail the page".
            if let Some(requires_python) = &file.requires_python {
                match VersionSpecifiers::from_str(requires_python) {
                    Ok(specifiers) => {
                        if !specifiers.contains_with_prereleases(&self.python_version, true) {
                            trace!(
                                "{identifier}: skipping {} because of python version {requires_python}",
                                file.filename
                            );
                            continue;
                        }
                    }
                    Err(err) => {
                        trace!(
                            "{identifier}: skipping {} because of an invalid python version specifier {requires_python}: {err}",
                            file.filename
                        );
                        continue;
                    }
                }
            }

            let Some(parsed) = DistFilename::try_from_filename(&file.filename, identifier)
            else {
                trace!("{identifier}: could not parse filename {}", file.filename);
                continue;
            };

            let (is_sdist, build_tag) = match &parsed {
                DistFilename::SourceDistFilename(_) => (true, None),
                DistFilename::WheelFilename(wheel) => {
                    if !wheel.is_compatible(&self.tags) {
                        trace!(
                            "{identifier}: ignoring {} with incompatible tags",
                            file.filename
                        );
                        continue;
                    }
                    (false, wheel.build_tag.clone())
                }
            };

            if is_sdist && !self.include_sdists {
                continue;
            }
            if !is_sdist && !self.include_wheels {
                continue;
            }
            if !version_is_usable(
                &self.constraints,
                identifier,
                parsed.version(),
                &identifier_reqs,
                &bad,
            ) {
                continue;
            }

            let metadata_url = (!is_sdist && file.has_metadata())
                .then(|| format!("{}.metadata", file.url));
            candidates.push(
                Candidate::new(
                    identifier.clone(),
                    parsed.version().clone(),
                    file.url,
                    extras.clone(),
                    is_sdist,
                    build_tag,
                )
                .with_metadata_url(metadata_url),
            );
        }

        candidates.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        Ok(candidates)
    }
}

/// Lookup of package versions via a callback.
pub struct GenericProvider {
    version_source: VersionSource,
    constraints: Constraints,
}

impl GenericProvider {
    pub fn new(version_source: VersionSource, constraints: Constraints) -> Self {
        Self {
            version_source,
            constraints,
        }
    }
}

#[async_trait]
impl Provider for GenericProvider {
    fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    async fn find_matches(
        &self,
        identifier: &PackageName,
        requirements: &RequirementsMap,
        incompatibilities: &CandidatesMap,
    ) -> Result<Vec<Candidate>, ResolverError> {
        let identifier_reqs = requirements.get(identifier).cloned().unwrap_or_default();
        let bad = bad_versions(incompatibilities, identifier);

        let mut candidates = Vec::new();
        for (url, version) in (self.version_source)(identifier) {
            if !version_is_usable(
                &self.constraints,
                identifier,
                &version,
                &identifier_reqs,
                &bad,
            ) {
                continue;
            }
            candidates.push(Candidate::new(
                identifier.clone(),
                version,
                url,
                Vec::new(),
                true,
                None,
            ));
        }
        candidates.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        Ok(candidates)
    }
}

/// Lookup of package versions from a GitHub repository's tags; the
/// candidate URL is the tag's tarball URL.
///
/// Supports `GITHUB_TOKEN` for authentication.
pub struct GitHubTagProvider {
    client: IndexClient,
    api_url: String,
    organization: String,
    repo: String,
    constraints: Constraints,
}

impl GitHubTagProvider {
    pub fn new(
        client: IndexClient,
        organization: impl Into<String>,
        repo: impl Into<String>,
        constraints: Constraints,
    ) -> Self {
        Self {
            client,
            api_url: GITHUB_API_URL.to_string(),
            organization: organization.into(),
            repo: repo.into(),
            constraints,
        }
    }

    #[must_use]
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }
}

#[async_trait]
impl Provider for GitHubTagProvider {
    fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    async fn find_matches(
        &self,
        identifier: &PackageName,
        requirements: &RequirementsMap,
        incompatibilities: &CandidatesMap,
    ) -> Result<Vec<Candidate>, ResolverError> {
        let identifier_reqs = requirements.get(identifier).cloned().unwrap_or_default();
        let bad = bad_versions(incompatibilities, identifier);

        let tags = self
            .client
            .github_tags(&self.api_url, &self.organization, &self.repo)
            .await?;
        let mut candidates = Vec::new();
        for tag in tags {
            let Ok(version) = Version::from_str(&tag.name) else {
                debug!(
                    "{identifier}: could not parse version from git tag {} on {}/{}",
                    tag.name, self.organization, self.repo
                );
                continue;
            };
            if !version_is_usable(
                &self.constraints,
                identifier,
                &version,
                &identifier_reqs,
                &bad,
            ) {
                continue;
            }
            candidates.push(Candidate::new(
                identifier.clone(),
                version,
                tag.tarball_url,
                Vec::new(),
                true,
                None,
            ));
        }
        candidates.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        Ok(candidates)
    }
}

/// Resolve a set of requirements against a provider.
///
/// Pinning order is fewest-candidates first, tie-broken by name; since
/// providers report no dependencies, one pass settles every input. Returns
/// one candidate per canonical name.
pub async fn resolve_from_provider(
    provider: &dyn Provider,
    requirements: &[Requirement],
) -> Result<IndexMap<PackageName, Candidate>, ResolverError> {
    let mut requirements_map: RequirementsMap = IndexMap::new();
    for requirement in requirements {
        requirements_map
            .entry(provider.identify(requirement))
            .or_default()
            .push(requirement.clone());
    }
    let incompatibilities: CandidatesMap = IndexMap::new();

    // Gather candidates per identifier, then pin in preference order.
    let mut matches: Vec<(PackageName, Vec<Candidate>)> = Vec::new();
    for identifier in requirements_map.keys() {
        let candidates = provider
            .find_matches(identifier, &requirements_map, &incompatibilities)
            .await?;
        matches.push((identifier.clone(), candidates));
    }
    matches.sort_by(|a, b| a.1.len().cmp(&b.1.len()).then_with(|| a.0.cmp(&b.0)));

    let mut mapping = IndexMap::new();
    for (identifier, candidates) in matches {
        let identifier_reqs = &requirements_map[&identifier];
        let considered: Vec<String> = candidates
            .iter()
            .map(|candidate| candidate.version().to_string())
            .collect();
        let pinned = candidates.into_iter().find(|candidate| {
            identifier_reqs
                .iter()
                .all(|requirement| provider.is_satisfied_by(requirement, candidate))
        });
        match pinned {
            Some(candidate) => {
                mapping.insert(identifier, candidate);
            }
            None => {
                let requirement = identifier_reqs
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(ResolverError::impossible(requirement, considered));
            }
        }
    }
    Ok(mapping)
}

/// Resolve a single requirement to `(url, version)`.
pub async fn resolve_requirement(
    provider: &dyn Provider,
    requirement: &Requirement,
) -> Result<(String, Version), ResolverError> {
    let mapping = resolve_from_provider(provider, std::slice::from_ref(requirement)).await?;
    let candidate = mapping
        .get(&requirement.name)
        .ok_or_else(|| ResolverError::impossible(requirement, Vec::new()))?;
    Ok((candidate.url().to_string(), candidate.version().clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fromager_client::IndexClientBuilder;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn name(s: &str) -> PackageName {
        PackageName::new(s).unwrap()
    }

    fn req(s: &str) -> Requirement {
        Requirement::from_str(s).unwrap()
    }

    fn version(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn generic(versions: &[&str]) -> GenericProvider {
        let pairs: Vec<(String, Version)> = versions
            .iter()
            .map(|v| (format!("https://example.com/pkg-{v}.tar.gz"), version(v)))
            .collect();
        GenericProvider::new(
            Box::new(move |_| pairs.clone()),
            Constraints::default(),
        )
    }

    #[tokio::test]
    async fn generic_picks_highest() -> anyhow::Result<()> {
        let provider = generic(&["1.0", "2.0", "1.5"]);
        let (url, resolved) = resolve_requirement(&provider, &req("pkg>=1.0")).await?;
        assert_eq!(resolved, version("2.0"));
        assert_eq!(url, "https://example.com/pkg-2.0.tar.gz");
        Ok(())
    }

    #[tokio::test]
    async fn generic_honors_specifier() -> anyhow::Result<()> {
        let provider = generic(&["1.0", "2.0"]);
        let (_, resolved) = resolve_requirement(&provider, &req("pkg<2.0")).await?;
        assert_eq!(resolved, version("1.0"));
        Ok(())
    }

    #[tokio::test]
    async fn generic_resolution_impossible() {
        let provider = generic(&["1.0"]);
        let err = resolve_requirement(&provider, &req("pkg>=9"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolverError::ResolutionImpossible { .. }));
    }

    #[tokio::test]
    async fn generic_applies_constraints() -> anyhow::Result<()> {
        let constraints = Constraints::new([req("pkg<2.0")]);
        let pairs = vec![
            ("https://example.com/pkg-1.0.tar.gz".to_string(), version("1.0")),
            ("https://example.com/pkg-2.0.tar.gz".to_string(), version("2.0")),
        ];
        let provider = GenericProvider::new(Box::new(move |_| pairs.clone()), constraints);
        let (_, resolved) = resolve_requirement(&provider, &req("pkg")).await?;
        assert_eq!(resolved, version("1.0"));
        Ok(())
    }

    #[tokio::test]
    async fn generic_excludes_prereleases_without_optin() -> anyhow::Result<()> {
        let provider = generic(&["1.0", "2.0rc1"]);
        let (_, resolved) = resolve_requirement(&provider, &req("pkg")).await?;
        assert_eq!(resolved, version("1.0"));
        Ok(())
    }

    #[tokio::test]
    async fn prerelease_constraint_is_optin() -> anyhow::Result<()> {
        let constraints = Constraints::new([req("pkg==2.0rc1")]);
        let pairs = vec![
            ("https://example.com/pkg-1.0.tar.gz".to_string(), version("1.0")),
            ("https://example.com/pkg-2.0rc1.tar.gz".to_string(), version("2.0rc1")),
        ];
        let provider = GenericProvider::new(Box::new(move |_| pairs.clone()), constraints);
        let (_, resolved) = resolve_requirement(&provider, &req("pkg")).await?;
        assert_eq!(resolved, version("2.0rc1"));
        Ok(())
    }

    fn pypi_provider(server_url: &str, include_sdists: bool, include_wheels: bool) -> PyPiProvider {
        PyPiProvider::new(
            IndexClientBuilder::new().retries(0).build(),
            server_url,
            include_sdists,
            include_wheels,
            Constraints::default(),
            Tags::from_env((3, 11)).unwrap(),
            version("3.11.4"),
        )
    }

    const INDEX_PAGE: &str = r#"<html><body>
        <a href="pkg-1.0.tar.gz#sha256=00">pkg-1.0.tar.gz</a>
        <a href="pkg-1.1.tar.gz#sha256=00">pkg-1.1.tar.gz</a>
        <a href="pkg-1.1-py3-none-any.whl#sha256=00">pkg-1.1-py3-none-any.whl</a>
        <a href="pkg-1.1-2-py3-none-any.whl#sha256=00">pkg-1.1-2-py3-none-any.whl</a>
        <a href="pkg-1.2-cp27-cp27m-manylinux1_x86_64.whl#sha256=00">pkg-1.2-cp27-cp27m-manylinux1_x86_64.whl</a>
        <a href="pkg-0.9.tar.gz#sha256=00" data-requires-python="&lt;3">pkg-0.9.tar.gz</a>
        <a href="pkg-0.8.tar.gz#sha256=00" data-requires-python="&gt;= '2.7'">pkg-0.8.tar.gz</a>
        <a href="other-9.9.tar.gz#sha256=00">other-9.9.tar.gz</a>
    </body></html>"#;

    async fn mock_index() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/simple/pkg/"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(INDEX_PAGE, "text/html"))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn pypi_sdists_only() -> anyhow::Result<()> {
        let server = mock_index().await;
        let provider = pypi_provider(&format!("{}/simple/", server.uri()), true, false);
        let matches = provider
            .find_matches(
                &name("pkg"),
                &RequirementsMap::from([(name("pkg"), vec![req("pkg")])]),
                &CandidatesMap::new(),
            )
            .await?;
        // 1.1 and 1.0; 0.9 requires python < 3, 0.8 has a broken specifier,
        // wheels are excluded, `other` has the wrong name.
        let versions: Vec<String> = matches.iter().map(|c| c.version().to_string()).collect();
        assert_eq!(versions, vec!["1.1", "1.0"]);
        assert!(matches.iter().all(Candidate::is_sdist));
        Ok(())
    }

    #[tokio::test]
    async fn pypi_wheels_sorted_by_build_tag() -> anyhow::Result<()> {
        let server = mock_index().await;
        let provider = pypi_provider(&format!("{}/simple/", server.uri()), false, true);
        let matches = provider
            .find_matches(
                &name("pkg"),
                &RequirementsMap::from([(name("pkg"), vec![req("pkg")])]),
                &CandidatesMap::new(),
            )
            .await?;
        // The cp27 wheel is tag-incompatible; the build-tag-2 rebuild of 1.1
        // sorts before the untagged one.
        let urls: Vec<&str> = matches.iter().map(Candidate::url).collect();
        assert_eq!(urls.len(), 2);
        assert!(urls[0].ends_with("pkg-1.1-2-py3-none-any.whl"));
        assert!(urls[1].ends_with("pkg-1.1-py3-none-any.whl"));
        Ok(())
    }

    #[tokio::test]
    async fn pypi_incompatibilities_skip_versions() -> anyhow::Result<()> {
        let server = mock_index().await;
        let provider = pypi_provider(&format!("{}/simple/", server.uri()), true, false);
        let bad = Candidate::new(
            name("pkg"),
            version("1.1"),
            "https://example.com/x",
            Vec::new(),
            true,
            None,
        );
        let matches = provider
            .find_matches(
                &name("pkg"),
                &RequirementsMap::from([(name("pkg"), vec![req("pkg")])]),
                &CandidatesMap::from([(name("pkg"), vec![bad])]),
            )
            .await?;
        let versions: Vec<String> = matches.iter().map(|c| c.version().to_string()).collect();
        assert_eq!(versions, vec!["1.0"]);
        Ok(())
    }

    #[tokio::test]
    async fn github_tag_provider() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        let page = r#"[
            {"name": "v1.1.0", "tarball_url": "https://api.github.com/repos/o/r/tarball/v1.1.0"},
            {"name": "not-a-version", "tarball_url": "https://api.github.com/repos/o/r/tarball/x"}
        ]"#;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/tags"))
            .respond_with(move |request: &wiremock::Request| {
                let query = request.url.query().unwrap_or_default();
                if query.contains("page=1") {
                    ResponseTemplate::new(200).set_body_raw(page, "application/json")
                } else {
                    ResponseTemplate::new(200).set_body_raw("[]", "application/json")
                }
            })
            .mount(&server)
            .await;

        let provider = GitHubTagProvider::new(
            IndexClientBuilder::new().retries(0).build(),
            "o",
            "r",
            Constraints::default(),
        )
        .with_api_url(server.uri());
        let (url, resolved) = resolve_requirement(&provider, &req("pkg")).await?;
        assert_eq!(resolved, version("1.1.0"));
        assert!(url.ends_with("/tarball/v1.1.0"));
        Ok(())
    }
}
