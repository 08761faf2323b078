use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use tracing::{debug, info};

use fromager_build::extract_wheel_dist_info_file;
use fromager_graph::{DependencyGraph, RequirementKind};
use fromager_pep440::Version;
use fromager_pep508::Requirement;
use fromager_resolver::{resolve_requirement, GenericProvider, PYPI_SERVER_URL};

use crate::context::WorkContext;
use crate::dependencies::{
    BUILD_BACKEND_REQ_FILE_NAME, BUILD_SDIST_REQ_FILE_NAME, BUILD_SYSTEM_REQ_FILE_NAME,
    FROMAGER_BUILD_REQ_PREFIX,
};
use crate::error::BootstrapError;
use crate::finders;
use crate::sources;
use crate::wheels;

/// The dependency chain from a top-level requirement down to the one being
/// processed: `(kind, requirement, resolved version)` frames.
pub(crate) type WhyStack = Vec<(RequirementKind, Requirement, Version)>;

/// The version a requirement pins exactly, when its specifiers are a single
/// `==`; used to consult version-specific settings before resolution.
pub(crate) fn pinned_version(req: &Requirement) -> Option<Version> {
    let mut specifiers = req.specifiers.iter();
    let first = specifiers.next()?;
    if specifiers.next().is_some() {
        return None;
    }
    (first.operator() == fromager_pep440::Operator::Equal).then(|| first.version().clone())
}

/// Decides which version of a requirement to use and where to get it:
/// top-level pins first, then a previous run's graph, then the network.
/// Resolutions are cached for the run.
pub(crate) struct ResolutionManager {
    prev_graph: Option<DependencyGraph>,
    cache_wheel_server_url: Option<String>,
    resolved: HashMap<String, (String, Version)>,
}

impl ResolutionManager {
    pub(crate) fn new(
        prev_graph: Option<DependencyGraph>,
        cache_wheel_server_url: Option<String>,
    ) -> Self {
        Self {
            prev_graph,
            cache_wheel_server_url,
            resolved: HashMap::new(),
        }
    }

    /// Resolve a requirement to `(download_url, version)`.
    ///
    /// Top-level requirements were settled in the pre-pass and must already
    /// hang off the graph root. Everything else consults, in order: the
    /// root's top-level pins, the previous graph (same parent name, same
    /// edge kind, same pre-built flag), and finally the index.
    pub(crate) async fn resolve_version(
        &mut self,
        ctx: &WorkContext,
        graph: &DependencyGraph,
        req: &Requirement,
        kind: RequirementKind,
        why: &WhyStack,
        pre_built: bool,
    ) -> Result<(String, Version), BootstrapError> {
        if kind == RequirementKind::TopLevel {
            for edge in graph
                .get_root_node()
                .get_outgoing_edges(&req.name, RequirementKind::TopLevel)
            {
                if edge.req == *req {
                    let node = graph
                        .get_node(&edge.key)
                        .expect("edge destinations exist");
                    return Ok((node.download_url.clone(), node.version.clone()));
                }
            }
            return Err(BootstrapError::Other(format!(
                "{}: {req} appears as a toplevel requirement but its resolution does not exist \
                 in the root node of the graph",
                req.name
            )));
        }

        let cache_key = req.to_string();
        if let Some(hit) = self.resolved.get(&cache_key) {
            debug!("resolved {cache_key} from cache");
            return Ok(hit.clone());
        }

        let resolution = if let Some(resolution) = self
            .resolve_from_graph(&ctx.constraints, graph, req, kind, pre_built, why)
            .await
        {
            debug!(
                "{}: resolved from previous bootstrap to {}",
                req.name, resolution.1
            );
            resolution
        } else if pre_built {
            let version_hint = pinned_version(req);
            let servers = wheels::get_wheel_server_urls(ctx, req, version_hint.as_ref());
            wheels::resolve_prebuilt_wheel(ctx, req, &servers).await?
        } else {
            sources::resolve_source(ctx, req, PYPI_SERVER_URL).await?
        };

        self.resolved.insert(cache_key, resolution.clone());
        Ok(resolution)
    }

    /// Resolution from recorded state: the current graph's top-level pins
    /// override anything; history applies only after that.
    async fn resolve_from_graph(
        &self,
        constraints: &fromager_settings::Constraints,
        graph: &DependencyGraph,
        req: &Requirement,
        kind: RequirementKind,
        pre_built: bool,
        why: &WhyStack,
    ) -> Option<(String, Version)> {
        let mut seen_versions: HashSet<String> = HashSet::new();

        // Top-level pins first, so a new top-level can move a package
        // anywhere in the tree without falling back to history.
        let mut top_level_candidates: Vec<(String, Version)> = Vec::new();
        for edge in graph
            .get_root_node()
            .get_outgoing_edges(&req.name, RequirementKind::TopLevel)
        {
            let node = graph.get_node(&edge.key)?;
            seen_versions.insert(node.version.to_string());
            top_level_candidates.push((node.download_url.clone(), node.version.clone()));
        }
        if let Some(resolution) = self
            .resolve_from_version_source(constraints, req, top_level_candidates)
            .await
        {
            return Some(resolution);
        }

        let prev_graph = self.prev_graph.as_ref()?;

        // History: any node with the same parent name that had an outgoing
        // edge to this name under this kind. Filtering on kind keeps the
        // bootstrap on the same route it took last time.
        let parent_name = why.last().map(|(_, parent_req, _)| &parent_req.name);
        let parent_nodes = match parent_name {
            Some(parent_name) => prev_graph.get_nodes_by_name(parent_name),
            None => vec![prev_graph.get_root_node()],
        };
        let mut history_candidates: Vec<(String, Version)> = Vec::new();
        for parent_node in parent_nodes {
            for edge in parent_node.get_outgoing_edges(&req.name, kind) {
                let Some(node) = prev_graph.get_node(&edge.key) else {
                    continue;
                };
                if node.pre_built == pre_built
                    && seen_versions.insert(node.version.to_string())
                {
                    history_candidates.push((node.download_url.clone(), node.version.clone()));
                }
            }
        }
        self.resolve_from_version_source(constraints, req, history_candidates)
            .await
    }

    /// Pick the best of a recorded candidate list, honoring current
    /// constraints; `None` when the list is empty or nothing matches.
    async fn resolve_from_version_source(
        &self,
        constraints: &fromager_settings::Constraints,
        req: &Requirement,
        version_source: Vec<(String, Version)>,
    ) -> Option<(String, Version)> {
        if version_source.is_empty() {
            return None;
        }
        let provider = GenericProvider::new(
            Box::new(move |_| version_source.clone()),
            constraints.clone(),
        );
        match resolve_requirement(&provider, req).await {
            Ok(resolution) => Some(resolution),
            Err(err) => {
                debug!("{}: could not resolve {req} from recorded versions: {err}", req.name);
                None
            }
        }
    }

    /// Look for a cached wheel for `(req, version)`: previously built,
    /// previously downloaded, then the remote cache server. Wheels whose
    /// build tag does not match the expected changelog tag are ignored.
    ///
    /// Returns `(wheel, unpack_dir)`; `unpack_dir` is set when the wheel
    /// carried fromager's embedded build-requirement lists, which are
    /// extracted there.
    pub(crate) async fn find_cached_wheel(
        &self,
        ctx: &WorkContext,
        req: &Requirement,
        resolved_version: &Version,
    ) -> Result<(Option<PathBuf>, Option<PathBuf>), BootstrapError> {
        let pbi = ctx.package_build_info(req);
        let expected_build_tag = pbi.build_tag(resolved_version);

        for search_in in [&ctx.wheels_build, &ctx.wheels_downloads] {
            info!(
                "{}: looking for existing wheel for version {resolved_version} with build tag \
                 {expected_build_tag:?} in {}",
                req.name,
                search_in.display()
            );
            if let Some(wheel) = finders::find_wheel(
                search_in,
                req,
                resolved_version,
                expected_build_tag.as_ref(),
            )? {
                info!("{}: found existing wheel {}", req.name, wheel.display());
                let unpack_dir = self.unpack_build_requirements(ctx, req, resolved_version, &wheel);
                return Ok((Some(wheel), unpack_dir));
            }
        }

        self.download_wheel_from_cache(ctx, req, resolved_version, expected_build_tag)
            .await
    }

    async fn download_wheel_from_cache(
        &self,
        ctx: &WorkContext,
        req: &Requirement,
        resolved_version: &Version,
        expected_build_tag: Option<fromager_distribution_filename::BuildTag>,
    ) -> Result<(Option<PathBuf>, Option<PathBuf>), BootstrapError> {
        let Some(cache_url) = &self.cache_wheel_server_url else {
            return Ok((None, None));
        };
        info!(
            "{}: checking if wheel was already uploaded to {cache_url}",
            req.name
        );
        let pinned = Requirement::pinned(req.name.clone(), resolved_version);
        let provider = fromager_resolver::PyPiProvider::new(
            ctx.client.clone(),
            cache_url.clone(),
            false,
            true,
            ctx.constraints.clone(),
            ctx.tags.clone(),
            ctx.python_version.clone(),
        );
        let (wheel_url, _) = match resolve_requirement(&provider, &pinned).await {
            Ok(resolution) => resolution,
            Err(err) => {
                info!(
                    "{}: did not find wheel for {resolved_version} in {cache_url}: {err}",
                    req.name
                );
                return Ok((None, None));
            }
        };

        let filename = wheels::wheel_filename_from_url(&wheel_url)?;
        let parsed = filename
            .parse::<fromager_distribution_filename::WheelFilename>()
            .map_err(|err| BootstrapError::Other(err.to_string()))?;
        if let Some(expected) = &expected_build_tag {
            if parsed.build_tag.as_ref() != Some(expected) {
                info!(
                    "{}: found wheel for {resolved_version} in cache but build tag does not \
                     match. Got {:?} but expected {expected}",
                    req.name, parsed.build_tag
                );
                return Ok((None, None));
            }
        }

        let cached_wheel =
            wheels::download_wheel(ctx, req, &wheel_url, &ctx.wheels_downloads).await?;
        info!("{}: found built wheel on cache server", req.name);
        let unpack_dir = self.unpack_build_requirements(ctx, req, resolved_version, &cached_wheel);
        Ok((Some(cached_wheel), unpack_dir))
    }

    /// Extract the three embedded requirement lists into the unpack dir
    /// under the names the phase loaders read. `None` when the wheel was
    /// not built by fromager.
    fn unpack_build_requirements(
        &self,
        ctx: &WorkContext,
        req: &Requirement,
        resolved_version: &Version,
        wheel: &PathBuf,
    ) -> Option<PathBuf> {
        let unpack_dir = ctx.create_unpack_dir(req, resolved_version).ok()?;
        for filename in [
            BUILD_SYSTEM_REQ_FILE_NAME,
            BUILD_BACKEND_REQ_FILE_NAME,
            BUILD_SDIST_REQ_FILE_NAME,
        ] {
            let embedded = format!("{FROMAGER_BUILD_REQ_PREFIX}-{filename}");
            if let Err(err) =
                extract_wheel_dist_info_file(wheel, &embedded, &unpack_dir, filename)
            {
                // A wheel without the embedded lists came from somewhere
                // else; fall back to a full source preparation.
                info!(
                    "{}: could not extract build requirements from wheel: {err}",
                    req.name
                );
                for cleanup in [
                    BUILD_SYSTEM_REQ_FILE_NAME,
                    BUILD_BACKEND_REQ_FILE_NAME,
                    BUILD_SDIST_REQ_FILE_NAME,
                ] {
                    let _ = fs_err::remove_file(unpack_dir.join(cleanup));
                }
                return None;
            }
        }
        info!(
            "{}: extracted build requirements from wheel into {}",
            req.name,
            unpack_dir.display()
        );
        Some(unpack_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fromager_normalize::PackageName;
    use fromager_settings::Constraints;
    use std::str::FromStr;

    fn name(s: &str) -> PackageName {
        PackageName::new(s).unwrap()
    }

    fn version(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn req(s: &str) -> Requirement {
        Requirement::from_str(s).unwrap()
    }

    #[test]
    fn pinned_version_only_for_exact_pins() {
        assert_eq!(pinned_version(&req("pkg==1.2.3")), Some(version("1.2.3")));
        assert_eq!(pinned_version(&req("pkg>=1.2.3")), None);
        assert_eq!(pinned_version(&req("pkg==1.2,<3")), None);
        assert_eq!(pinned_version(&req("pkg")), None);
    }

    /// Prior graph pinned pbr==5 under parent blah; the new run has a
    /// top-level pbr==8. Resolving pbr>=5 under any parent must take the
    /// top-level pin, not the history.
    #[tokio::test]
    async fn top_level_pin_overrides_history() {
        let mut prev_graph = DependencyGraph::new();
        prev_graph
            .add_dependency(
                None,
                None,
                RequirementKind::TopLevel,
                &req("blah"),
                &version("1.0"),
                "url-blah",
                false,
            )
            .unwrap();
        prev_graph
            .add_dependency(
                Some(&name("blah")),
                Some(&version("1.0")),
                RequirementKind::Install,
                &req("pbr==5"),
                &version("5"),
                "url-pbr-5",
                false,
            )
            .unwrap();

        let mut graph = DependencyGraph::new();
        graph
            .add_dependency(
                None,
                None,
                RequirementKind::TopLevel,
                &req("pbr==8"),
                &version("8"),
                "url-pbr-8",
                false,
            )
            .unwrap();

        let manager = ResolutionManager::new(Some(prev_graph), None);
        let why: WhyStack = vec![(
            RequirementKind::TopLevel,
            req("foo"),
            version("1.0"),
        )];
        let resolution = manager
            .resolve_from_graph(
                &Constraints::default(),
                &graph,
                &req("pbr>=5"),
                RequirementKind::Install,
                false,
                &why,
            )
            .await;
        assert_eq!(resolution, Some(("url-pbr-8".to_string(), version("8"))));
    }

    /// Without a matching top-level pin, the previous graph's record for
    /// the same parent and kind wins.
    #[tokio::test]
    async fn history_resolves_same_route() {
        let mut prev_graph = DependencyGraph::new();
        prev_graph
            .add_dependency(
                None,
                None,
                RequirementKind::TopLevel,
                &req("parent"),
                &version("1.0"),
                "url-parent",
                false,
            )
            .unwrap();
        prev_graph
            .add_dependency(
                Some(&name("parent")),
                Some(&version("1.0")),
                RequirementKind::Install,
                &req("pbr>=5"),
                &version("5"),
                "url-pbr-5",
                false,
            )
            .unwrap();
        // The same name under a different kind settled differently; the
        // kind filter must not pick this up.
        prev_graph
            .add_dependency(
                Some(&name("parent")),
                Some(&version("1.0")),
                RequirementKind::BuildSystem,
                &req("pbr"),
                &version("6"),
                "url-pbr-6",
                false,
            )
            .unwrap();

        let graph = DependencyGraph::new();
        let manager = ResolutionManager::new(Some(prev_graph), None);
        let why: WhyStack = vec![(
            RequirementKind::TopLevel,
            req("parent"),
            version("1.0"),
        )];
        let resolution = manager
            .resolve_from_graph(
                &Constraints::default(),
                &graph,
                &req("pbr>=5"),
                RequirementKind::Install,
                false,
                &why,
            )
            .await;
        assert_eq!(resolution, Some(("url-pbr-5".to_string(), version("5"))));
    }

    /// Constraints narrow history candidates like any other resolution.
    #[tokio::test]
    async fn history_honors_constraints() {
        let mut prev_graph = DependencyGraph::new();
        prev_graph
            .add_dependency(
                None,
                None,
                RequirementKind::TopLevel,
                &req("parent"),
                &version("1.0"),
                "",
                false,
            )
            .unwrap();
        for (pbr_version, url) in [("5", "url-5"), ("7", "url-7")] {
            prev_graph
                .add_dependency(
                    Some(&name("parent")),
                    Some(&version("1.0")),
                    RequirementKind::Install,
                    &req("pbr"),
                    &version(pbr_version),
                    url,
                    false,
                )
                .unwrap();
        }

        let graph = DependencyGraph::new();
        let manager = ResolutionManager::new(Some(prev_graph), None);
        let constraints = Constraints::new([req("pbr<7")]);
        let why: WhyStack = vec![(
            RequirementKind::TopLevel,
            req("parent"),
            version("1.0"),
        )];
        let resolution = manager
            .resolve_from_graph(
                &constraints,
                &graph,
                &req("pbr>=5"),
                RequirementKind::Install,
                false,
                &why,
            )
            .await;
        assert_eq!(resolution, Some(("url-5".to_string(), version("5"))));
    }
}
