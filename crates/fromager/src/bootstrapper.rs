use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use futures::FutureExt;
use itertools::Itertools;
use tracing::{debug, info, warn};

use fromager_build::{get_build_backend, BuildEnvironment, HookCaller};
use fromager_graph::{DependencyGraph, RequirementKind};
use fromager_normalize::{ExtraName, PackageName};
use fromager_pep440::Version;
use fromager_pep508::Requirement;

use crate::build_order::BuildOrder;
use crate::context::WorkContext;
use crate::dependencies;
use crate::error::{is_missing_dependency_output, BootstrapError};
use crate::finders;
use crate::resolution::{pinned_version, ResolutionManager, WhyStack};
use crate::server;
use crate::sources::{self, SourceKind};
use crate::wheels;

/// A build failure captured in test mode instead of stopping the run.
#[derive(Debug)]
pub(crate) struct FailedBuild {
    pub req: Requirement,
    pub version: Version,
    pub error: String,
}

/// The recursive driver: resolve, acquire, bootstrap build dependencies,
/// build, then recurse into install dependencies. Single-threaded; every
/// state mutation lands before the next requirement advances, and the graph
/// and build order are rewritten to disk on every change so an interrupted
/// run is recoverable.
pub(crate) struct Bootstrapper {
    ctx: WorkContext,
    graph: DependencyGraph,
    resolutions: ResolutionManager,
    /// `(name, sorted extras, version)` triples already processed; the
    /// extras are part of the key because the same package can contribute
    /// different dependency sets per extra.
    seen_requirements: HashSet<(PackageName, Vec<ExtraName>, String)>,
    build_order: BuildOrder,
    why: WhyStack,
    test_mode: bool,
    failed_builds: Vec<FailedBuild>,
}

impl Bootstrapper {
    pub(crate) fn new(
        ctx: WorkContext,
        graph: DependencyGraph,
        prev_graph: Option<DependencyGraph>,
        cache_wheel_server_url: Option<String>,
        test_mode: bool,
    ) -> Self {
        let cache_wheel_server_url =
            cache_wheel_server_url.or_else(|| Some(ctx.wheel_server_url.clone()));
        Self {
            ctx,
            graph,
            resolutions: ResolutionManager::new(prev_graph, cache_wheel_server_url),
            seen_requirements: HashSet::new(),
            build_order: BuildOrder::new(),
            why: Vec::new(),
            test_mode,
            failed_builds: Vec::new(),
        }
    }

    pub(crate) fn into_parts(self) -> (WorkContext, DependencyGraph, Vec<FailedBuild>) {
        (self.ctx, self.graph, self.failed_builds)
    }

    /// Settle one requirement and everything below it. Returns the version
    /// the requirement resolved to.
    pub(crate) fn bootstrap<'a>(
        &'a mut self,
        req: Requirement,
        kind: RequirementKind,
    ) -> BoxFuture<'a, Result<Version, BootstrapError>> {
        async move {
            let constraint = self.ctx.constraints.get_constraint(&req.name).cloned();
            if let Some(constraint) = &constraint {
                info!(
                    "{}: incoming requirement {req} matches constraint {constraint}. Will apply both.",
                    req.name
                );
            }

            let pbi = self.ctx.package_build_info(&req);
            let pre_built_hint = pbi.pre_built(pinned_version(&req).as_ref());
            let (source_url, resolved_version) = self
                .resolutions
                .resolve_version(&self.ctx, &self.graph, &req, kind, &self.why, pre_built_hint)
                .await?;
            // Settings may flip to pre-built for specific versions only.
            let pre_built = pbi.pre_built(Some(&resolved_version));

            self.add_to_graph(&req, kind, &resolved_version, &source_url, pre_built)?;

            // Avoid cyclic dependencies and redundant processing.
            if self.has_been_seen(&req, &resolved_version) {
                debug!(
                    "{}: redundant {kind} dependency {req} ({resolved_version}) for {}",
                    req.name,
                    self.explain()
                );
                return Ok(resolved_version);
            }
            self.mark_as_seen(&req, &resolved_version);
            info!(
                "{}: new {kind} dependency {req} resolves to {resolved_version}",
                req.name
            );

            self.why.push((kind, req.clone(), resolved_version.clone()));
            let outcome = self
                .process(&req, &resolved_version, &source_url, pre_built, constraint.as_ref())
                .await;
            self.why.pop();

            match outcome {
                Ok(()) => Ok(resolved_version),
                Err(err) if self.test_mode => {
                    warn!(
                        "{}: build failed in test mode, continuing: {err}",
                        req.name
                    );
                    self.failed_builds.push(FailedBuild {
                        req: req.clone(),
                        version: resolved_version.clone(),
                        error: err.to_string(),
                    });
                    Ok(resolved_version)
                }
                Err(err) => Err(err),
            }
        }
        .boxed()
    }

    /// Acquire, build, and recurse for one settled `(req, version)`.
    async fn process(
        &mut self,
        req: &Requirement,
        resolved_version: &Version,
        source_url: &str,
        pre_built: bool,
        constraint: Option<&Requirement>,
    ) -> Result<(), BootstrapError> {
        let mut sdist_root_dir: Option<PathBuf> = None;
        let mut build_env_dir: Option<PathBuf> = None;

        let (wheel_filename, unpack_dir, source_url_type) = if pre_built {
            let (wheel, unpack_dir) = self
                .download_prebuilt(req, resolved_version, source_url)
                .await?;
            (wheel, unpack_dir, SourceKind::Prebuilt)
        } else {
            let source_url_type = sources::get_source_type(&self.ctx, req);
            let (cached_wheel, unpacked_cached_wheel) = self
                .resolutions
                .find_cached_wheel(&self.ctx, req, resolved_version)
                .await?;

            let root_dir = match &unpacked_cached_wheel {
                Some(unpack_dir) => {
                    // The build requirements came out of the cached wheel;
                    // the source tree itself is not needed.
                    let module = req.name.as_override_module_name().to_string();
                    unpack_dir.join(format!("{module}-{resolved_version}"))
                }
                None => {
                    let source_filename =
                        sources::download_source(&self.ctx, req, resolved_version, source_url)
                            .await?;
                    let prepared =
                        sources::prepare_source(&self.ctx, req, &source_filename, resolved_version)?;
                    sdist_root_dir = Some(prepared.clone());
                    prepared
                }
            };
            let unpack_dir = root_dir
                .parent()
                .expect("sdist root has a parent")
                .to_path_buf();

            // Bootstrap the build dependencies whether or not we will
            // build: a cached wheel still records them in the graph.
            let build_env = BuildEnvironment::new(
                &unpack_dir,
                &self.ctx.python,
                &self.ctx.python_version.to_string(),
            )?;
            build_env_dir = Some(build_env.path().to_path_buf());
            self.prepare_build_dependencies(req, resolved_version, &root_dir, &build_env)
                .await?;

            let wheel_filename = match cached_wheel {
                Some(cached_wheel) => cached_wheel,
                None => {
                    self.build(req, resolved_version, &root_dir, &build_env)?
                }
            };
            (wheel_filename, unpack_dir, source_url_type)
        };

        // Process installation dependencies for all wheels.
        let install_dependencies = dependencies::get_install_dependencies_of_wheel(
            &self.ctx,
            req,
            &wheel_filename,
            &unpack_dir,
        )?;
        for dep in sorted_by_name(&install_dependencies) {
            self.bootstrap(dep.clone(), RequirementKind::Install)
                .await
                .map_err(|err| err.wrap(self.explain()))?;
        }

        // The requirement finalizes only now, with its whole subtree
        // settled, so the build order is a post-order walk: everything a
        // wheel needs appears at an earlier index.
        if self.build_order.add(
            req,
            resolved_version,
            source_url,
            source_url_type,
            pre_built,
            constraint,
        ) {
            self.build_order.write_to_file(&self.ctx.build_order_file())?;
        }

        if let Some(sdist_root_dir) = sdist_root_dir {
            self.ctx.cleanup_dir(&sdist_root_dir, "source tree");
        }
        if let Some(build_env_dir) = build_env_dir {
            self.ctx.cleanup_dir(&build_env_dir, "build environment");
        }
        Ok(())
    }

    /// The three build-dependency phases. Each phase is recorded in a
    /// requirements file, recursed into, and installed into the build env
    /// before the next phase's hook can run.
    async fn prepare_build_dependencies(
        &mut self,
        req: &Requirement,
        resolved_version: &Version,
        sdist_root_dir: &Path,
        build_env: &BuildEnvironment,
    ) -> Result<(), BootstrapError> {
        let build_system_deps =
            dependencies::get_build_system_dependencies(&self.ctx, req, sdist_root_dir)?;
        self.handle_build_requirements(
            req,
            resolved_version,
            RequirementKind::BuildSystem,
            &build_system_deps,
            build_env,
        )
        .await?;

        let hook_caller = self.hook_caller(req, resolved_version, sdist_root_dir, build_env)?;
        let build_backend_deps = dependencies::get_build_backend_dependencies(
            &self.ctx,
            req,
            sdist_root_dir,
            &hook_caller,
        )?;
        self.handle_build_requirements(
            req,
            resolved_version,
            RequirementKind::BuildBackend,
            &build_backend_deps,
            build_env,
        )
        .await?;

        let build_sdist_deps = dependencies::get_build_sdist_dependencies(
            &self.ctx,
            req,
            sdist_root_dir,
            &hook_caller,
        )?;
        self.handle_build_requirements(
            req,
            resolved_version,
            RequirementKind::BuildSdist,
            &build_sdist_deps,
            build_env,
        )
        .await?;
        Ok(())
    }

    async fn handle_build_requirements(
        &mut self,
        req: &Requirement,
        version: &Version,
        kind: RequirementKind,
        build_dependencies: &BTreeSet<Requirement>,
        build_env: &BuildEnvironment,
    ) -> Result<(), BootstrapError> {
        let mut resolved_peers = Vec::new();
        for dep in sorted_by_name(build_dependencies) {
            let resolved = self
                .bootstrap(dep.clone(), kind)
                .await
                .map_err(|err| err.wrap(self.explain()))?;
            resolved_peers.push(format!("{}=={resolved}", dep.name));

            // The dependency must be installed before later hooks run;
            // build backends import their own requirements.
            let pinned = Requirement::pinned(dep.name.clone(), &resolved);
            let environ = wheels::build_environ(&self.ctx, req, Some(version), build_env)?;
            if let Err(err) = build_env.install(
                &[pinned],
                &self.ctx.pip_wheel_server_args(),
                &environ,
            ) {
                return Err(self.classify_install_failure(kind, err, &resolved_peers));
            }
        }
        Ok(())
    }

    /// Distinguish "pip could not find a build dependency" from other
    /// failures; the former carries the peer resolutions for the report.
    fn classify_install_failure(
        &self,
        kind: RequirementKind,
        err: fromager_build::BuildError,
        resolved_peers: &[String],
    ) -> BootstrapError {
        if let fromager_build::BuildError::CommandFailed { output_tail, .. } = &err {
            if is_missing_dependency_output(output_tail) {
                return BootstrapError::MissingDependency {
                    kind: kind.to_string(),
                    resolved: resolved_peers.to_vec(),
                    detail: output_tail.clone(),
                };
            }
        }
        BootstrapError::Build(err)
    }

    fn hook_caller(
        &self,
        req: &Requirement,
        version: &Version,
        sdist_root_dir: &Path,
        build_env: &BuildEnvironment,
    ) -> Result<HookCaller, BootstrapError> {
        let pbi = self.ctx.package_build_info(req);
        let build_dir = pbi.build_dir(sdist_root_dir);
        let backend = get_build_backend(&build_dir)?;
        let environ = wheels::build_environ(&self.ctx, req, Some(version), build_env)?;
        Ok(HookCaller::new(
            build_env.python().to_path_buf(),
            build_dir,
            backend,
            environ,
            self.ctx.network_isolation,
        ))
    }

    /// Build the sdist (unless one exists) and the wheel, then refresh the
    /// mirror so the next build environment can install the result.
    fn build(
        &mut self,
        req: &Requirement,
        resolved_version: &Version,
        sdist_root_dir: &Path,
        build_env: &BuildEnvironment,
    ) -> Result<PathBuf, BootstrapError> {
        let hook_caller = self.hook_caller(req, resolved_version, sdist_root_dir, build_env)?;

        match finders::find_sdist(&self.ctx.sdists_builds, req, resolved_version)? {
            Some(existing) => {
                info!(
                    "{}: have sdist version {resolved_version}: {}",
                    req.name,
                    existing.display()
                );
            }
            None => {
                if let Err(err) = sources::build_sdist(
                    &self.ctx,
                    req,
                    resolved_version,
                    sdist_root_dir,
                    &hook_caller,
                    build_env,
                ) {
                    warn!("{}: failed to build source distribution: {err}", req.name);
                }
            }
        }

        info!("{}: starting build of {}", req.name, self.explain());
        let built = wheels::build_wheel(
            &self.ctx,
            req,
            sdist_root_dir,
            resolved_version,
            &hook_caller,
        )?;
        server::update_wheel_mirror(&self.ctx)?;
        // The mirror update moves the built file into the downloads pool.
        let wheel_filename = self.ctx.wheels_downloads.join(
            built
                .file_name()
                .expect("built wheel has a filename"),
        );
        info!(
            "{}: built wheel for version {resolved_version}: {}",
            req.name,
            wheel_filename.display()
        );
        Ok(wheel_filename)
    }

    async fn download_prebuilt(
        &mut self,
        req: &Requirement,
        resolved_version: &Version,
        wheel_url: &str,
    ) -> Result<(PathBuf, PathBuf), BootstrapError> {
        info!("{}: requirement {req} uses a pre-built wheel", req.name);
        let wheel_filename =
            wheels::download_wheel(&self.ctx, req, wheel_url, &self.ctx.wheels_prebuilt).await?;

        // Copy into the mirror pool so anything that needs to install it
        // can; the copy in the prebuilt directory makes post-run pruning
        // easy.
        let dest_name = self.ctx.wheels_downloads.join(
            wheel_filename
                .file_name()
                .expect("wheel has a filename"),
        );
        if !dest_name.exists() {
            info!(
                "{}: updating temporary mirror with pre-built wheel",
                req.name
            );
            fs_err::copy(&wheel_filename, &dest_name)?;
            server::update_wheel_mirror(&self.ctx)?;
        }
        let unpack_dir = self.ctx.create_unpack_dir(req, resolved_version)?;
        Ok((wheel_filename, unpack_dir))
    }

    fn add_to_graph(
        &mut self,
        req: &Requirement,
        kind: RequirementKind,
        req_version: &Version,
        download_url: &str,
        pre_built: bool,
    ) -> Result<(), BootstrapError> {
        // Top-level requirements were added to the graph by the pre-pass.
        if kind == RequirementKind::TopLevel {
            return Ok(());
        }
        let parent = self
            .why
            .last()
            .map(|(_, parent_req, parent_version)| (parent_req.name.clone(), parent_version.clone()));
        // Record the edge before the seen check so every edge is captured
        // for the constraints file, including ones into existing nodes.
        self.graph.add_dependency(
            parent.as_ref().map(|(name, _)| name),
            parent.as_ref().map(|(_, version)| version),
            kind,
            req,
            req_version,
            download_url,
            pre_built,
        )?;
        self.graph.write_to_file(&self.ctx.graph_file())?;
        Ok(())
    }

    /// The why-chain formatted from the current requirement up to the
    /// top-level that pulled it in.
    fn explain(&self) -> String {
        self.why
            .iter()
            .rev()
            .map(|(kind, req, version)| format!("{kind} dependency {req} ({version})"))
            .join(" for ")
    }

    fn resolved_key(
        req: &Requirement,
        version: &Version,
    ) -> (PackageName, Vec<ExtraName>, String) {
        (req.name.clone(), req.sorted_extras(), version.to_string())
    }

    fn mark_as_seen(&mut self, req: &Requirement, version: &Version) {
        let key = Self::resolved_key(req, version);
        debug!("{}: remembering seen sdist {key:?}", req.name);
        self.seen_requirements.insert(key);
    }

    fn has_been_seen(&self, req: &Requirement, version: &Version) -> bool {
        self.seen_requirements
            .contains(&Self::resolved_key(req, version))
    }
}

fn sorted_by_name(requirements: &BTreeSet<Requirement>) -> Vec<&Requirement> {
    let mut sorted: Vec<&Requirement> = requirements.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn req(s: &str) -> Requirement {
        Requirement::from_str(s).unwrap()
    }

    fn version(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn seen_key_includes_extras_and_version() {
        let with_extras = Bootstrapper::resolved_key(&req("a[x,y]"), &version("1.0"));
        let plain = Bootstrapper::resolved_key(&req("a"), &version("1.0"));
        assert_ne!(with_extras, plain);

        // Extras order does not matter.
        let reordered = Bootstrapper::resolved_key(&req("a[y,x]"), &version("1.0"));
        assert_eq!(with_extras, reordered);

        let other_version = Bootstrapper::resolved_key(&req("a"), &version("2.0"));
        assert_ne!(plain, other_version);
    }

    #[test]
    fn sorted_by_name_orders() {
        let set: BTreeSet<Requirement> =
            [req("zebra"), req("alpha>=1"), req("middle")].into_iter().collect();
        let names: Vec<&str> = sorted_by_name(&set)
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["alpha", "middle", "zebra"]);
    }
}
