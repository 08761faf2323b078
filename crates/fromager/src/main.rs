use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use owo_colors::OwoColorize;

mod bootstrapper;
mod build_order;
mod commands;
mod constraints_writer;
mod context;
mod dependencies;
mod error;
mod finders;
mod logging;
mod overrides;
mod resolution;
mod server;
mod sources;
mod wheels;

use crate::commands::ExitStatus;
use crate::context::WorkContextBuilder;

#[derive(Parser)]
#[command(author, version, about)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Use verbose output.
    #[arg(global = true, long, short)]
    verbose: bool,

    /// Also write logs to this file.
    #[arg(global = true, long)]
    log_file: Option<PathBuf>,

    /// Base directory for temporary working files.
    #[arg(global = true, long, env = "FROMAGER_WORK_DIR", default_value = "work-dir")]
    work_dir: PathBuf,

    /// Directory for source distributions (downloads and rebuilt sdists).
    #[arg(global = true, long, env = "FROMAGER_SDISTS_REPO", default_value = "sdists-repo")]
    sdists_repo: PathBuf,

    /// Directory for wheels (downloads, fresh builds, and the mirror).
    #[arg(global = true, long, env = "FROMAGER_WHEELS_REPO", default_value = "wheels-repo")]
    wheels_repo: PathBuf,

    /// Global settings file.
    #[arg(global = true, long, env = "FROMAGER_SETTINGS_FILE", default_value = "overrides/settings.yaml")]
    settings_file: PathBuf,

    /// Directory of per-package settings files.
    #[arg(global = true, long, env = "FROMAGER_SETTINGS_DIR", default_value = "overrides/settings")]
    settings_dir: PathBuf,

    /// Directory of patches, one `<package>-<version>` directory each.
    #[arg(global = true, long, env = "FROMAGER_PATCHES_DIR", default_value = "overrides/patches")]
    patches_dir: PathBuf,

    /// Constraints file applied to every resolution.
    #[arg(global = true, long, env = "FROMAGER_CONSTRAINTS_FILE")]
    constraints_file: Option<PathBuf>,

    /// Build variant (e.g. cpu, cuda, rocm).
    #[arg(global = true, long, env = "FROMAGER_VARIANT", default_value = "cpu")]
    variant: String,

    /// Maximum number of parallel jobs a build may use.
    #[arg(global = true, long, short)]
    jobs: Option<u64>,

    /// The Python interpreter to build with.
    #[arg(global = true, long, default_value = "python3")]
    python: String,

    /// Remove build artifacts between packages.
    #[arg(global = true, long, default_value_t = true, action = clap::ArgAction::Set)]
    cleanup: bool,

    /// Run build hooks without network access (Linux only).
    #[arg(global = true, long)]
    network_isolation: bool,

    /// URL of the local wheel mirror used to install build dependencies.
    #[arg(global = true, long, env = "FROMAGER_WHEEL_SERVER_URL")]
    wheel_server_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute and build the dependencies of a set of requirements
    /// recursively.
    Bootstrap(BootstrapArgs),
    /// Inspect or post-process a dependency graph file.
    Graph(GraphArgs),
    /// Inspect a build-order file.
    BuildOrder(BuildOrderArgs),
}

#[derive(Args)]
struct BootstrapArgs {
    /// Requirement specifications, including optional version constraints.
    toplevel: Vec<String>,

    /// pip requirements file(s).
    #[arg(long, short = 'r')]
    requirements_file: Vec<PathBuf>,

    /// Graph file produced by a previous bootstrap.
    #[arg(long, short = 'p')]
    previous_bootstrap_file: Option<PathBuf>,

    /// Wheel server from which fromager may download wheels it has built
    /// before.
    #[arg(long, short = 'c')]
    cache_wheel_server_url: Option<String>,

    /// Record build failures and continue instead of stopping.
    #[arg(long)]
    test_mode: bool,
}

#[derive(Args)]
struct GraphArgs {
    #[command(subcommand)]
    command: commands::graph::GraphCommands,
}

#[derive(Args)]
struct BuildOrderArgs {
    #[command(subcommand)]
    command: commands::build_order::BuildOrderCommands,
}

async fn inner() -> Result<ExitStatus> {
    let cli = Cli::parse();

    logging::setup_logging(cli.verbose, cli.log_file.as_deref())?;

    let builder = WorkContextBuilder {
        work_dir: cli.work_dir,
        sdists_repo: cli.sdists_repo,
        wheels_repo: cli.wheels_repo,
        settings_file: cli.settings_file,
        settings_dir: cli.settings_dir,
        patches_dir: cli.patches_dir,
        constraints_file: cli.constraints_file,
        variant: cli.variant,
        max_jobs: cli.jobs,
        python: cli.python,
        cleanup: cli.cleanup,
        network_isolation: cli.network_isolation,
        wheel_server_url: cli.wheel_server_url,
    };

    match cli.command {
        Commands::Bootstrap(args) => {
            let context = builder.build()?;
            commands::bootstrap::bootstrap(
                context,
                &args.toplevel,
                &args.requirements_file,
                args.previous_bootstrap_file.as_deref(),
                args.cache_wheel_server_url.as_deref(),
                args.test_mode,
            )
            .await
        }
        Commands::Graph(args) => commands::graph::run(args.command),
        Commands::BuildOrder(args) => commands::build_order::run(args.command),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match inner().await {
        Ok(code) => code.into(),
        Err(err) => {
            #[allow(clippy::print_stderr)]
            {
                let mut causes = err.chain();
                eprintln!("{}: {}", "error".red().bold(), causes.next().unwrap());
                for err in causes {
                    eprintln!("  {}: {}", "Caused by".red().bold(), err);
                }
            }
            ExitStatus::Error.into()
        }
    }
}
