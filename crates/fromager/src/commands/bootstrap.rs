use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use tracing::{error, info};

use fromager_graph::{DependencyGraph, RequirementKind};
use fromager_pep508::{evaluate_marker, Requirement};
use fromager_resolver::PYPI_SERVER_URL;
use fromager_settings::parse_requirements_file;

use crate::bootstrapper::Bootstrapper;
use crate::commands::ExitStatus;
use crate::constraints_writer::write_constraints_file;
use crate::context::WorkContext;
use crate::resolution::pinned_version;
use crate::server;
use crate::sources;
use crate::wheels;

/// Gather the top-level requirements from the command line and any
/// requirements files, dropping entries whose markers exclude this
/// platform. Dependencies further down are filtered later, in the context
/// of their parent.
fn requirements_from_args(
    ctx: &WorkContext,
    toplevel: &[String],
    req_files: &[impl AsRef<Path>],
) -> Result<Vec<Requirement>> {
    let mut parsed_req: Vec<String> = toplevel.to_vec();
    for filename in req_files {
        parsed_req.extend(parse_requirements_file(filename.as_ref())?);
    }
    let mut to_build = Vec::new();
    for dep in parsed_req {
        let req = Requirement::from_str(&dep)
            .with_context(|| format!("invalid requirement `{dep}`"))?;
        if !evaluate_marker(&ctx.marker_env, &req, &req, &[]) {
            info!(
                "{}: ignoring {} dependency {req} because of its marker expression",
                req.name,
                RequirementKind::TopLevel
            );
        } else {
            to_build.push(req);
        }
    }
    Ok(to_build)
}

pub(crate) async fn bootstrap(
    ctx: WorkContext,
    toplevel: &[String],
    requirements_files: &[impl AsRef<Path>],
    previous_bootstrap_file: Option<&Path>,
    cache_wheel_server_url: Option<&str>,
    test_mode: bool,
) -> Result<ExitStatus> {
    let to_build = requirements_from_args(&ctx, toplevel, requirements_files)?;
    if to_build.is_empty() {
        error!("pass a requirement specification or use -r to pass a requirements file");
        return Ok(ExitStatus::MissingInput);
    }
    info!(
        "bootstrapping {:?} variant of {:?}",
        ctx.settings.variant(),
        to_build.iter().map(ToString::to_string).collect::<Vec<_>>()
    );

    let prev_graph = match previous_bootstrap_file {
        Some(path) => {
            info!("reading previous bootstrap data from {}", path.display());
            Some(DependencyGraph::from_file(path)?)
        }
        None => {
            info!("no previous bootstrap data");
            None
        }
    };

    let pre_built = ctx.settings.list_pre_built();
    if !pre_built.is_empty() {
        info!("treating {pre_built:?} as pre-built wheels");
    }

    // Resolve all top-level requirements before bootstrapping, so that a
    // top-level pin can upgrade a package anywhere in the tree without
    // falling back to history.
    info!("resolving top-level dependencies before building");
    let mut graph = DependencyGraph::new();
    for req in &to_build {
        let pbi = ctx.package_build_info(req);
        let is_pre_built = pbi.pre_built(pinned_version(req).as_ref());
        let (source_url, version) = if is_pre_built {
            let servers = wheels::get_wheel_server_urls(&ctx, req, pinned_version(req).as_ref());
            wheels::resolve_prebuilt_wheel(&ctx, req, &servers).await?
        } else {
            sources::resolve_source(&ctx, req, PYPI_SERVER_URL).await?
        };
        info!("{req} resolves to {version}");
        graph.add_dependency(
            None,
            None,
            RequirementKind::TopLevel,
            req,
            &version,
            &source_url,
            pbi.pre_built(Some(&version)),
        )?;
        graph.write_to_file(&ctx.graph_file())?;
    }

    let mut bootstrapper = Bootstrapper::new(
        ctx,
        graph,
        prev_graph,
        cache_wheel_server_url.map(String::from),
        test_mode,
    );
    for req in &to_build {
        if let Err(err) = bootstrapper
            .bootstrap(req.clone(), RequirementKind::TopLevel)
            .await
        {
            if err.is_network_isolation() {
                error!("a build reached for the network while isolation was on; rerun without --network-isolation or fix the build: {err}");
            }
            return Err(err.into());
        }
    }

    let (ctx, graph, failed_builds) = bootstrapper.into_parts();

    // Pre-built wheels were copied into the downloads pool for the build
    // environments; remove them so the pool holds only built wheels.
    server::prune_prebuilt_from_downloads(&ctx)?;

    let constraints_filename = ctx.constraints_file();
    info!(
        "writing installation dependencies to {}",
        constraints_filename.display()
    );
    let mut output = fs_err::File::create(&constraints_filename)?;
    if !write_constraints_file(&graph, &mut output)? {
        anyhow::bail!(
            "could not produce a pip compatible constraints file. Please review {} for more details",
            constraints_filename.display()
        );
    }

    if !failed_builds.is_empty() {
        error!("{} builds failed in test mode:", failed_builds.len());
        for failure in &failed_builds {
            error!("  {} ({}): {}", failure.req, failure.version, failure.error);
        }
        return Ok(ExitStatus::Error);
    }
    Ok(ExitStatus::Success)
}
